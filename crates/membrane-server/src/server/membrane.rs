//! The orchestrator.
//!
//! A [`Membrane`] owns the six worker managers, serves them over gRPC, starts
//! the application, waits for enough workers to register and then hands the
//! managers to the gateway. [`Membrane::stop`] tears everything down again.

use crate::server::{
    config::ServerConfig,
    gateway::{Gateway, GatewayHandlers},
    process::{ChildProcessManager, ProcessManager},
    workers::{
        WorkerCount, WorkerOptions, apis::ApiRouter, jobs::JobManager,
        schedules::ScheduleManager, storage::StorageListenerManager, topics::SubscriberManager,
        websockets::WebsocketManager,
    },
};
use anyhow::anyhow;
use core::{net::SocketAddr, time::Duration};
use membrane_core::proto::{
    apis::api_server::ApiServer, batch::job_server::JobServer,
    schedules::schedules_server::SchedulesServer,
    storage::storage_listener_server::StorageListenerServer,
    topics::subscriber_server::SubscriberServer,
    websockets::websocket_handler_server::WebsocketHandlerServer,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{codec::CompressionEncoding, transport::Server};

/// Lifecycle of a [`Membrane`], advanced by [`Membrane::start`] and
/// [`Membrane::stop`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembraneState {
    Created,
    PreProcessesStarted,
    ListenerBound,
    ManagersRegistered,
    ChildProcessStarted,
    AwaitingMinimumWorkers,
    GatewayStarted,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Error)]
pub enum MembraneError {
    #[error("a gateway is required to start the membrane")]
    MissingGateway,

    #[error("pre-process failed: {0:#}")]
    PreProcess(anyhow::Error),

    #[error("failed to bind service address {address}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("gRPC server failed: {0}")]
    Serve(String),

    #[error("failed to start user process: {0:#}")]
    UserProcess(anyhow::Error),

    #[error(
        "timed out after {timeout:?} waiting for {required} workers to register ({available} registered)"
    )]
    WorkerTimeout {
        required: usize,
        available: usize,
        timeout: Duration,
    },

    #[error("Gateway Error: {0:#}, exiting")]
    Gateway(anyhow::Error),

    #[error("Process error: {0:#}, exiting")]
    Process(anyhow::Error),
}

/// Interval of the minimum worker poll.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(5);

macro_rules! compressed {
    ($service:expr) => {
        $service
            .send_compressed(CompressionEncoding::Zstd)
            .send_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Deflate)
            .accept_compressed(CompressionEncoding::Zstd)
            .accept_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Deflate)
    };
}

/// Builder for [`Membrane`]. Only the gateway is mandatory.
pub struct MembraneBuilder {
    service_address: SocketAddr,
    min_workers: usize,
    worker_timeout: Duration,
    max_workers: u32,
    shutdown_grace: Duration,
    worker_options: WorkerOptions,
    gateway: Option<Arc<dyn Gateway>>,
    process_manager: Option<Arc<dyn ProcessManager>>,
    apis: Option<ApiRouter>,
    storage: Option<StorageListenerManager>,
    topics: Option<SubscriberManager>,
    websockets: Option<WebsocketManager>,
    schedules: Option<ScheduleManager>,
    jobs: Option<JobManager>,
}

impl Default for MembraneBuilder {
    fn default() -> Self {
        Self {
            service_address: SocketAddr::from(([127, 0, 0, 1], 50051)),
            min_workers: 1,
            worker_timeout: Duration::from_secs(10),
            max_workers: 300,
            shutdown_grace: Duration::from_secs(5),
            worker_options: WorkerOptions::default(),
            gateway: None,
            process_manager: None,
            apis: None,
            storage: None,
            topics: None,
            websockets: None,
            schedules: None,
            jobs: None,
        }
    }
}

impl MembraneBuilder {
    /// Applies addresses, limits and worker options from `config`.
    pub fn config(mut self, config: &ServerConfig) -> Self {
        self.service_address = config.service_address;
        self.min_workers = config.min_workers;
        self.worker_timeout = config.worker_timeout;
        self.max_workers = config.max_workers;
        self.worker_options = config.worker_options();
        self
    }

    pub fn service_address(mut self, address: SocketAddr) -> Self {
        self.service_address = address;
        self
    }

    pub fn min_workers(mut self, min_workers: usize) -> Self {
        self.min_workers = min_workers;
        self
    }

    pub fn worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn max_workers(mut self, max_workers: u32) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// How long [`Membrane::stop`] lets open worker streams drain before the
    /// gRPC server is aborted.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Options for managers created by [`MembraneBuilder::build`].
    pub fn worker_options(mut self, options: WorkerOptions) -> Self {
        self.worker_options = options;
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn process_manager(mut self, process_manager: Arc<dyn ProcessManager>) -> Self {
        self.process_manager = Some(process_manager);
        self
    }

    pub fn api_router(mut self, apis: ApiRouter) -> Self {
        self.apis = Some(apis);
        self
    }

    pub fn storage_listeners(mut self, storage: StorageListenerManager) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn subscribers(mut self, topics: SubscriberManager) -> Self {
        self.topics = Some(topics);
        self
    }

    pub fn websockets(mut self, websockets: WebsocketManager) -> Self {
        self.websockets = Some(websockets);
        self
    }

    pub fn schedules(mut self, schedules: ScheduleManager) -> Self {
        self.schedules = Some(schedules);
        self
    }

    pub fn jobs(mut self, jobs: JobManager) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Fills unset managers with defaults built from the worker options.
    ///
    /// # Errors
    ///
    /// [`MembraneError::MissingGateway`] when no gateway was supplied.
    pub fn build(self) -> Result<Membrane, MembraneError> {
        let gateway = self.gateway.ok_or(MembraneError::MissingGateway)?;
        let options = self.worker_options;
        let process_manager = self
            .process_manager
            .unwrap_or_else(|| Arc::new(ChildProcessManager::new(Vec::new(), Vec::new())));
        let (server_failure, _) = watch::channel(None);

        Ok(Membrane {
            service_address: self.service_address,
            min_workers: self.min_workers,
            worker_timeout: self.worker_timeout,
            max_workers: self.max_workers.max(1),
            shutdown_grace: self.shutdown_grace,
            gateway,
            process_manager,
            apis: self.apis.unwrap_or_else(|| ApiRouter::new(options)),
            storage: self
                .storage
                .unwrap_or_else(|| StorageListenerManager::new(options)),
            topics: self.topics.unwrap_or_else(|| SubscriberManager::new(options)),
            websockets: self
                .websockets
                .unwrap_or_else(|| WebsocketManager::new(options)),
            schedules: self
                .schedules
                .unwrap_or_else(|| ScheduleManager::new(options)),
            jobs: self.jobs.unwrap_or_else(|| JobManager::new(options)),
            state: RwLock::new(MembraneState::Created),
            local_address: Mutex::new(None),
            shutdown: CancellationToken::new(),
            server: Mutex::new(None),
            server_failure: Arc::new(server_failure),
        })
    }
}

type ServerTask = JoinHandle<Result<(), tonic::transport::Error>>;

pub struct Membrane {
    service_address: SocketAddr,
    min_workers: usize,
    worker_timeout: Duration,
    max_workers: u32,
    shutdown_grace: Duration,
    gateway: Arc<dyn Gateway>,
    process_manager: Arc<dyn ProcessManager>,
    apis: ApiRouter,
    storage: StorageListenerManager,
    topics: SubscriberManager,
    websockets: WebsocketManager,
    schedules: ScheduleManager,
    jobs: JobManager,
    state: RwLock<MembraneState>,
    local_address: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
    server: Mutex<Option<ServerTask>>,
    server_failure: Arc<watch::Sender<Option<String>>>,
}

impl Membrane {
    pub fn builder() -> MembraneBuilder {
        MembraneBuilder::default()
    }

    pub fn state(&self) -> MembraneState {
        *self.state.read()
    }

    /// Address the gRPC service actually bound, once it has.
    pub fn local_address(&self) -> Option<SocketAddr> {
        *self.local_address.lock()
    }

    /// Workers registered across every manager.
    pub fn worker_count(&self) -> usize {
        self.apis.worker_count()
            + self.storage.worker_count()
            + self.topics.worker_count()
            + self.websockets.worker_count()
            + self.schedules.worker_count()
            + self.jobs.worker_count()
    }

    /// Handler references handed to the gateway.
    pub fn handlers(&self) -> GatewayHandlers {
        GatewayHandlers {
            apis: Arc::new(self.apis.clone()),
            storage: Arc::new(self.storage.clone()),
            topics: Arc::new(self.topics.clone()),
            websockets: Arc::new(self.websockets.clone()),
            schedules: Arc::new(self.schedules.clone()),
            jobs: Arc::new(self.jobs.clone()),
        }
    }

    fn set_state(&self, state: MembraneState) {
        *self.state.write() = state;
        tracing::debug!(?state, "membrane state changed");
    }

    /// Brings the membrane up and runs it until the gateway returns or the
    /// application exits.
    ///
    /// A clean gateway shutdown returns `Ok(())`. [`Membrane::stop`] should
    /// be called afterwards in every case.
    pub async fn start(&self) -> Result<(), MembraneError> {
        self.process_manager
            .start_pre_processes()
            .await
            .map_err(MembraneError::PreProcess)?;
        self.set_state(MembraneState::PreProcessesStarted);

        let address = self.service_address;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| MembraneError::Bind { address, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| MembraneError::Bind { address, source })?;
        *self.local_address.lock() = Some(bound);
        self.set_state(MembraneState::ListenerBound);

        self.serve(listener).await;
        self.set_state(MembraneState::ManagersRegistered);
        tracing::info!(address = %bound, max_workers = self.max_workers, "worker service listening");

        let env = [("SERVICE_ADDRESS".to_string(), bound.to_string())];
        self.process_manager
            .start_user_process(&env)
            .await
            .map_err(MembraneError::UserProcess)?;
        self.set_state(MembraneState::ChildProcessStarted);

        self.set_state(MembraneState::AwaitingMinimumWorkers);
        tokio::select! {
            result = self.wait_for_workers() => result?,
            err = self.server_failed() => return Err(err),
        }
        tracing::info!(workers = self.worker_count(), "minimum workers registered");

        self.set_state(MembraneState::GatewayStarted);
        let gateway = self.gateway.start(self.handlers());
        let monitor = self.process_manager.monitor();
        self.set_state(MembraneState::Running);

        tokio::select! {
            result = gateway => match result {
                Ok(()) => {
                    tracing::info!("gateway stopped");
                    Ok(())
                }
                Err(err) => Err(MembraneError::Gateway(err)),
            },
            result = monitor => {
                let err = result.err().unwrap_or_else(|| anyhow!("application exited"));
                Err(MembraneError::Process(err))
            }
            err = self.server_failed() => Err(err),
        }
    }

    /// Stops the gateway, the gRPC server and every managed process, in that
    /// order. Failures are logged and never cut the sequence short.
    pub async fn stop(&self) {
        self.set_state(MembraneState::Stopping);

        if let Err(err) = self.gateway.stop().await {
            tracing::error!(error = %err, "failed to stop gateway");
        }

        self.shutdown.cancel();
        let server = self.server.lock().take();
        if let Some(mut server) = server {
            match tokio::time::timeout(self.shutdown_grace, &mut server).await {
                Ok(Ok(Ok(()))) => tracing::info!("worker service stopped"),
                Ok(Ok(Err(err))) => tracing::error!(error = %err, "worker service failed"),
                Ok(Err(err)) => tracing::error!(error = %err, "worker service task failed"),
                Err(_) => {
                    tracing::warn!(
                        grace = ?self.shutdown_grace,
                        "worker streams still open, aborting worker service"
                    );
                    server.abort();
                }
            }
        }

        if let Err(err) = self.process_manager.stop_all().await {
            tracing::error!(error = %err, "failed to stop processes");
        }

        self.set_state(MembraneState::Stopped);
    }

    /// Serves every manager plus health checks on `listener` in a background
    /// task that ends when the membrane is stopped.
    async fn serve(&self, listener: TcpListener) {
        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter.set_serving::<ApiServer<ApiRouter>>().await;
        health_reporter
            .set_serving::<StorageListenerServer<StorageListenerManager>>()
            .await;
        health_reporter
            .set_serving::<SubscriberServer<SubscriberManager>>()
            .await;
        health_reporter
            .set_serving::<WebsocketHandlerServer<WebsocketManager>>()
            .await;
        health_reporter
            .set_serving::<SchedulesServer<ScheduleManager>>()
            .await;
        health_reporter.set_serving::<JobServer<JobManager>>().await;

        let router = Server::builder()
            .max_concurrent_streams(Some(self.max_workers))
            .add_service(health_service)
            .add_service(compressed!(ApiServer::new(self.apis.clone())))
            .add_service(compressed!(StorageListenerServer::new(self.storage.clone())))
            .add_service(compressed!(SubscriberServer::new(self.topics.clone())))
            .add_service(compressed!(WebsocketHandlerServer::new(
                self.websockets.clone()
            )))
            .add_service(compressed!(SchedulesServer::new(self.schedules.clone())))
            .add_service(compressed!(JobServer::new(self.jobs.clone())));

        let incoming = TcpListenerStream::new(listener);
        let shutdown = self.shutdown.clone().cancelled_owned();
        let failure = Arc::clone(&self.server_failure);
        let task = tokio::spawn(async move {
            let result = router.serve_with_incoming_shutdown(incoming, shutdown).await;
            if let Err(err) = &result {
                tracing::error!(error = %err, "worker service failed");
                failure.send_replace(Some(err.to_string()));
            }
            result
        });
        *self.server.lock() = Some(task);
    }

    async fn wait_for_workers(&self) -> Result<(), MembraneError> {
        let mut interval = tokio::time::interval(WORKER_POLL_INTERVAL);
        let enough = async {
            loop {
                interval.tick().await;
                if self.worker_count() >= self.min_workers {
                    break;
                }
            }
        };
        tokio::time::timeout(self.worker_timeout, enough)
            .await
            .map_err(|_| MembraneError::WorkerTimeout {
                required: self.min_workers,
                available: self.worker_count(),
                timeout: self.worker_timeout,
            })
    }

    /// Resolves with the error if the background gRPC server fails.
    async fn server_failed(&self) -> MembraneError {
        let mut failure = self.server_failure.subscribe();
        let message = failure
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|message| message.clone());
        match message {
            Some(message) => MembraneError::Serve(message),
            None => futures::future::pending().await,
        }
    }
}
