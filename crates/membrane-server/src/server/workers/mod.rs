//! Per-trigger worker managers.
//!
//! Every manager owns the registrations of one trigger kind and the matching
//! rule that picks a worker for an incoming trigger:
//!
//! - [`apis::ApiRouter`] - method and path template matching.
//! - [`storage::StorageListenerManager`] - bucket, event type and key prefix.
//! - [`topics::SubscriberManager`] - fan-out to every subscriber of a topic.
//! - [`websockets::WebsocketManager`] - one handler per socket and event type.
//! - [`schedules::ScheduleManager`] - one handler per schedule.
//! - [`jobs::JobManager`] - one handler per job.
//!
//! The stream handshake is shared: the first message must be a registration,
//! conflicting registrations are refused before anything is acknowledged, the
//! empty registration response goes out first, and the registration is
//! dropped again when the stream ends.

pub mod apis;
pub mod jobs;
pub mod schedules;
pub mod storage;
pub mod topics;
pub mod websockets;

use crate::server::{
    broker::RequestBroker,
    telemetry::{
        decrement_workers_connected, increment_dispatch_errors, increment_dispatches,
        increment_registration_errors, increment_worker_registrations,
        increment_workers_connected, record_dispatch_duration,
    },
};
use core::{pin::Pin, pin::pin, time::Duration};
use futures::{Stream, StreamExt};
use membrane_core::{Error, Result, types::IdentifiableMessage};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::sync::mpsc;
use tonic::Status;

/// One connected worker stream.
pub type WorkerConnection<Req, Resp> = Arc<RequestBroker<Req, Resp>>;

/// Server-streaming half handed back to tonic.
pub type WorkerStream<T> = Pin<Box<dyn Stream<Item = core::result::Result<T, Status>> + Send>>;

/// Number of workers currently registered with a manager.
pub trait WorkerCount {
    fn worker_count(&self) -> usize;
}

/// Tuning shared by every manager.
#[derive(Clone, Copy, Debug)]
pub struct WorkerOptions {
    /// Upper bound on a single worker round trip. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Capacity of the outbound channel feeding each worker stream.
    pub stream_buffer_size: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            request_timeout: None,
            stream_buffer_size: 16,
        }
    }
}

/// Registration bookkeeping implemented by each manager.
pub(crate) trait WorkerRegistry: Clone + Send + Sync + 'static {
    /// Membrane to worker.
    type Request: IdentifiableMessage + Send + 'static;
    /// Worker to membrane.
    type Response: IdentifiableMessage + Send + 'static;
    type Registration: Send;

    /// Label used in logs and metrics.
    const KIND: &'static str;

    /// Extracts the registration from a stream's first message.
    fn registration(message: Self::Response) -> Option<Self::Registration>;

    /// Empty registration response.
    fn ack() -> Self::Request;

    fn register(
        &self,
        registration: Self::Registration,
        worker: WorkerConnection<Self::Request, Self::Response>,
    ) -> Result<()>;

    /// Removes every registration held by `worker`.
    fn unregister(&self, worker: &WorkerConnection<Self::Request, Self::Response>);
}

/// Runs the registration handshake and then the broker's receive loop for one
/// worker stream.
pub(crate) async fn serve_worker<R, S>(
    registry: R,
    inbound: S,
    outbound: mpsc::Sender<core::result::Result<R::Request, Status>>,
) where
    R: WorkerRegistry,
    S: Stream<Item = core::result::Result<R::Response, Status>> + Send,
{
    let mut inbound = pin!(inbound);

    let registration = match inbound.next().await {
        Some(Ok(message)) => R::registration(message),
        Some(Err(status)) => {
            tracing::debug!(kind = R::KIND, code = ?status.code(), "worker stream failed before registering");
            return;
        }
        None => return,
    };
    let Some(registration) = registration else {
        increment_registration_errors(R::KIND);
        tracing::warn!(kind = R::KIND, "rejecting worker: first message was not a registration");
        let _ = outbound.send(Err(Error::MissingRegistration.into())).await;
        return;
    };

    // Holding a slot up front keeps the acknowledgement ahead of any request
    // a gateway pushes once the registration becomes visible.
    let Ok(ack_slot) = outbound.reserve().await else {
        return;
    };

    let worker: WorkerConnection<R::Request, R::Response> =
        Arc::new(RequestBroker::new(outbound.clone()));
    // The broker must accept sends from the moment the worker is routable.
    let run = worker.run(inbound);
    if let Err(err) = registry.register(registration, Arc::clone(&worker)) {
        increment_registration_errors(R::KIND);
        tracing::warn!(kind = R::KIND, error = %err, "rejecting worker registration");
        drop(ack_slot);
        let _ = outbound.send(Err(err.into())).await;
        return;
    }
    let _registered = Registered {
        registry: &registry,
        worker: &worker,
    };
    increment_worker_registrations(R::KIND);
    increment_workers_connected(R::KIND);

    ack_slot.send(Ok(R::ack()));
    tracing::info!(kind = R::KIND, "worker registered");

    match run.await {
        Ok(()) => tracing::info!(kind = R::KIND, "worker disconnected"),
        Err(err) => tracing::warn!(kind = R::KIND, error = %err, "worker stream closed with error"),
    }
}

/// Drops a worker's registration when its stream task ends or is cancelled.
struct Registered<'a, R: WorkerRegistry> {
    registry: &'a R,
    worker: &'a WorkerConnection<R::Request, R::Response>,
}

impl<R: WorkerRegistry> Drop for Registered<'_, R> {
    fn drop(&mut self) {
        self.registry.unregister(self.worker);
        decrement_workers_connected(R::KIND);
    }
}

/// Sends one request to a worker, applying the configured timeout and
/// recording dispatch metrics.
pub(crate) async fn dispatch<Req, Resp>(
    kind: &'static str,
    worker: &WorkerConnection<Req, Resp>,
    request: Req,
    timeout: Option<Duration>,
) -> Result<Resp>
where
    Req: IdentifiableMessage + Send + 'static,
    Resp: IdentifiableMessage + Send + 'static,
{
    let start = Instant::now();
    increment_dispatches(kind);

    let result = match timeout {
        Some(timeout) => worker.send_timeout(request, timeout).await,
        None => worker.send(request).await,
    };

    record_dispatch_duration(kind, start.elapsed().as_secs_f64() * 1000.0);
    if let Err(err) = &result {
        increment_dispatch_errors(kind);
        tracing::debug!(kind, error = %err, "dispatch failed");
    }
    result
}

/// Registry allowing exactly one worker per name, optionally with a value
/// kept alongside each registration.
pub(crate) struct NamedWorkers<Req, Resp, Meta = ()> {
    workers: RwLock<HashMap<String, (WorkerConnection<Req, Resp>, Meta)>>,
}

impl<Req, Resp, Meta> Default for NamedWorkers<Req, Resp, Meta> {
    fn default() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }
}

impl<Req, Resp> NamedWorkers<Req, Resp> {
    /// Claims `name` for `worker`, or returns `conflict(name)` as a
    /// registration error when the name is taken.
    pub(crate) fn insert(
        &self,
        name: String,
        worker: WorkerConnection<Req, Resp>,
        conflict: impl FnOnce(&str) -> String,
    ) -> Result<()> {
        self.insert_with(name, worker, (), conflict)
    }
}

impl<Req, Resp, Meta> NamedWorkers<Req, Resp, Meta> {
    /// Like [`NamedWorkers::insert`], storing `meta` in the same entry.
    pub(crate) fn insert_with(
        &self,
        name: String,
        worker: WorkerConnection<Req, Resp>,
        meta: Meta,
        conflict: impl FnOnce(&str) -> String,
    ) -> Result<()> {
        let mut workers = self.workers.write();
        if workers.contains_key(&name) {
            return Err(Error::RegistrationConflict {
                reason: conflict(&name),
            });
        }
        workers.insert(name, (worker, meta));
        Ok(())
    }

    pub(crate) fn get(&self, name: &str) -> Option<WorkerConnection<Req, Resp>> {
        self.workers.read().get(name).map(|(worker, _)| Arc::clone(worker))
    }

    /// Removes every name held by `worker` and returns them.
    pub(crate) fn remove_worker(&self, worker: &WorkerConnection<Req, Resp>) -> Vec<String> {
        let mut workers = self.workers.write();
        let names: Vec<String> = workers
            .iter()
            .filter(|(_, (held, _))| Arc::ptr_eq(held, worker))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            workers.remove(name);
        }
        names
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.read().len()
    }
}

impl<Req, Resp, Meta: Clone> NamedWorkers<Req, Resp, Meta> {
    pub(crate) fn meta(&self, name: &str) -> Option<Meta> {
        self.workers.read().get(name).map(|(_, meta)| meta.clone())
    }

    /// Every registered name with its value, sorted by name.
    pub(crate) fn entries(&self) -> Vec<(String, Meta)> {
        let mut entries: Vec<_> = self
            .workers
            .read()
            .iter()
            .map(|(name, (_, meta))| (name.clone(), meta.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory worker streams for exercising managers without a transport.

    use super::*;
    use core::time::Duration;
    use tokio::task::JoinHandle;
    use tokio_stream::wrappers::ReceiverStream;

    /// Client side of a worker stream connected straight to a manager.
    pub(crate) struct TestWorker<Req, Resp> {
        pub(crate) requests: mpsc::Receiver<core::result::Result<Req, Status>>,
        pub(crate) responses: mpsc::Sender<core::result::Result<Resp, Status>>,
    }

    impl<Req, Resp> TestWorker<Req, Resp>
    where
        Req: IdentifiableMessage + Send + 'static,
        Resp: IdentifiableMessage + Send + 'static,
    {
        /// Answers every request with `respond`, echoing the request ID, until
        /// the stream closes. Dropping the returned handle leaves the worker
        /// connected; aborting it disconnects.
        pub(crate) fn respond_with<F>(self, respond: F) -> JoinHandle<()>
        where
            F: Fn(Req) -> Resp + Send + 'static,
        {
            let TestWorker {
                mut requests,
                responses,
            } = self;
            tokio::spawn(async move {
                while let Some(Ok(request)) = requests.recv().await {
                    let id = request.id().to_owned();
                    let mut response = respond(request);
                    response.set_id(id);
                    if responses.send(Ok(response)).await.is_err() {
                        break;
                    }
                }
            })
        }
    }

    /// Opens a stream against `registry`, sends `registration` and returns
    /// the worker together with the first message the manager sent back.
    pub(crate) async fn connect<R: WorkerRegistry>(
        registry: R,
        registration: R::Response,
    ) -> (
        TestWorker<R::Request, R::Response>,
        core::result::Result<R::Request, Status>,
    ) {
        let (responses, inbound) = mpsc::channel(8);
        let (outbound, mut requests) = mpsc::channel(8);
        tokio::spawn(serve_worker(
            registry,
            ReceiverStream::new(inbound),
            outbound,
        ));

        responses
            .send(Ok(registration))
            .await
            .expect("manager stopped reading");
        let first = requests
            .recv()
            .await
            .expect("manager closed the stream without answering");

        (
            TestWorker {
                requests,
                responses,
            },
            first,
        )
    }

    /// Polls `condition` until it holds or a second passes.
    pub(crate) async fn eventually(condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
