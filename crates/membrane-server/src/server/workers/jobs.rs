//! Batch job handlers. One worker per job name.

use super::{
    NamedWorkers, WorkerConnection, WorkerCount, WorkerOptions, WorkerRegistry, WorkerStream,
    dispatch, serve_worker,
};
use membrane_core::{
    Error, Result,
    proto::batch::{
        ClientMessage, RegistrationRequest, RegistrationResponse, ServerMessage, client_message,
        job_server::Job, server_message,
    },
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

pub type JobWorker = WorkerConnection<ServerMessage, ClientMessage>;

/// Submits batch jobs to their handlers.
#[tonic::async_trait]
pub trait JobRequestHandler: WorkerCount + Send + Sync {
    /// Forwards `request`, which must carry a job request, to the handler of
    /// its job.
    async fn handle_request(&self, request: ServerMessage) -> Result<ClientMessage>;
}

/// Manager for job handlers.
#[derive(Clone, Default)]
pub struct JobManager {
    handlers: Arc<NamedWorkers<ServerMessage, ClientMessage>>,
    options: WorkerOptions,
}

impl JobManager {
    pub fn new(options: WorkerOptions) -> Self {
        Self {
            handlers: Arc::default(),
            options,
        }
    }
}

impl WorkerCount for JobManager {
    fn worker_count(&self) -> usize {
        self.handlers.len()
    }
}

impl WorkerRegistry for JobManager {
    type Request = ServerMessage;
    type Response = ClientMessage;
    type Registration = RegistrationRequest;

    const KIND: &'static str = "job";

    fn registration(message: ClientMessage) -> Option<RegistrationRequest> {
        match message.content {
            Some(client_message::Content::RegistrationRequest(registration)) => Some(registration),
            _ => None,
        }
    }

    fn ack() -> ServerMessage {
        ServerMessage {
            id: String::new(),
            content: Some(server_message::Content::RegistrationResponse(
                RegistrationResponse {},
            )),
        }
    }

    fn register(&self, registration: RegistrationRequest, worker: JobWorker) -> Result<()> {
        self.handlers
            .insert(registration.job_name.clone(), worker, |name| {
                format!("job handler already registered for job: {}", name)
            })?;
        tracing::info!(
            job = %registration.job_name,
            requirements = ?registration.requirements,
            "registering job handler"
        );
        Ok(())
    }

    fn unregister(&self, worker: &JobWorker) {
        self.handlers.remove_worker(worker);
    }
}

#[tonic::async_trait]
impl JobRequestHandler for JobManager {
    #[tracing::instrument(skip_all, fields(trigger = "job"))]
    async fn handle_request(&self, request: ServerMessage) -> Result<ClientMessage> {
        let Some(server_message::Content::JobRequest(job)) = request.content.as_ref() else {
            return Err(Error::InvalidRequest {
                reason: "job requests must carry a job request".to_string(),
            });
        };
        let worker = self
            .handlers
            .get(&job.job_name)
            .ok_or_else(|| Error::NoWorker {
                context: format!("job: {}", job.job_name),
            })?;
        dispatch(Self::KIND, &worker, request, self.options.request_timeout).await
    }
}

#[tonic::async_trait]
impl Job for JobManager {
    type HandleJobStream = WorkerStream<ServerMessage>;

    async fn handle_job(
        &self,
        request: Request<Streaming<ClientMessage>>,
    ) -> core::result::Result<Response<Self::HandleJobStream>, Status> {
        let (tx, rx) = mpsc::channel(self.options.stream_buffer_size);
        tokio::spawn(serve_worker(self.clone(), request.into_inner(), tx));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
