//! Scheduled interval handlers.
//!
//! One worker per schedule name. The cadence a worker registers with is kept
//! so gateways can provision the matching timer.

use super::{
    NamedWorkers, WorkerConnection, WorkerCount, WorkerOptions, WorkerRegistry, WorkerStream,
    dispatch, serve_worker,
};
use membrane_core::{
    Error, Result,
    proto::schedules::{
        ClientMessage, RegistrationRequest, RegistrationResponse, ServerMessage, client_message,
        registration_request::Cadence, schedules_server::Schedules, server_message,
    },
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

pub type ScheduleWorker = WorkerConnection<ServerMessage, ClientMessage>;

/// Triggers schedule handlers.
#[tonic::async_trait]
pub trait ScheduleRequestHandler: WorkerCount + Send + Sync {
    /// Forwards `request`, which must carry an interval request, to the
    /// handler of its schedule.
    async fn handle_request(&self, request: ServerMessage) -> Result<ClientMessage>;

    /// Registered schedules and the cadence each asked for.
    fn schedules(&self) -> Vec<(String, Option<Cadence>)>;
}

/// Manager for schedule handlers.
#[derive(Clone, Default)]
pub struct ScheduleManager {
    handlers: Arc<NamedWorkers<ServerMessage, ClientMessage, Option<Cadence>>>,
    options: WorkerOptions,
}

impl ScheduleManager {
    pub fn new(options: WorkerOptions) -> Self {
        Self {
            handlers: Arc::default(),
            options,
        }
    }

    /// Cadence registered for `schedule`, if the schedule is registered and
    /// declared one.
    pub fn cadence(&self, schedule: &str) -> Option<Cadence> {
        self.handlers.meta(schedule).flatten()
    }
}

impl WorkerCount for ScheduleManager {
    fn worker_count(&self) -> usize {
        self.handlers.len()
    }
}

impl WorkerRegistry for ScheduleManager {
    type Request = ServerMessage;
    type Response = ClientMessage;
    type Registration = RegistrationRequest;

    const KIND: &'static str = "schedule";

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

    fn register(&self, registration: RegistrationRequest, worker: ScheduleWorker) -> Result<()> {
        let RegistrationRequest {
            schedule_name,
            cadence,
        } = registration;
        self.handlers
            .insert_with(schedule_name.clone(), worker, cadence.clone(), |name| {
                format!("schedule handler already registered for schedule: {}", name)
            })?;
        tracing::info!(schedule = %schedule_name, cadence = ?cadence, "registering schedule handler");
        Ok(())
    }

    fn unregister(&self, worker: &ScheduleWorker) {
        self.handlers.remove_worker(worker);
    }
}

#[tonic::async_trait]
impl ScheduleRequestHandler for ScheduleManager {
    #[tracing::instrument(skip_all, fields(trigger = "schedule"))]
    async fn handle_request(&self, request: ServerMessage) -> Result<ClientMessage> {
        let Some(server_message::Content::IntervalRequest(interval)) = request.content.as_ref()
        else {
            return Err(Error::InvalidRequest {
                reason: "schedule requests must carry an interval request".to_string(),
            });
        };
        let worker = self
            .handlers
            .get(&interval.schedule_name)
            .ok_or_else(|| Error::NoWorker {
                context: format!("schedule: {}", interval.schedule_name),
            })?;
        dispatch(Self::KIND, &worker, request, self.options.request_timeout).await
    }

    fn schedules(&self) -> Vec<(String, Option<Cadence>)> {
        self.handlers.entries()
    }
}

#[tonic::async_trait]
impl Schedules for ScheduleManager {
    type ScheduleStream = WorkerStream<ServerMessage>;

    async fn schedule(
        &self,
        request: Request<Streaming<ClientMessage>>,
    ) -> core::result::Result<Response<Self::ScheduleStream>, Status> {
        let (tx, rx) = mpsc::channel(self.options.stream_buffer_size);
        tokio::spawn(serve_worker(self.clone(), request.into_inner(), tx));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::workers::testing::{connect, eventually};
    use membrane_core::proto::schedules::{
        IntervalRequest, IntervalResponse, ScheduleCron, ScheduleEvery,
    };
    use tonic::Code;

    fn registration(name: &str, cadence: Option<Cadence>) -> ClientMessage {
        ClientMessage {
            id: String::new(),
            content: Some(client_message::Content::RegistrationRequest(
                RegistrationRequest {
                    schedule_name: name.to_string(),
                    cadence,
                },
            )),
        }
    }

    fn interval(name: &str) -> ServerMessage {
        ServerMessage {
            id: "tick-1".to_string(),
            content: Some(server_message::Content::IntervalRequest(IntervalRequest {
                schedule_name: name.to_string(),
            })),
        }
    }

    fn every(rate: &str) -> Option<Cadence> {
        Some(Cadence::Every(ScheduleEvery {
            rate: rate.to_string(),
        }))
    }

    #[tokio::test]
    async fn interval_reaches_the_registered_handler() {
        let manager = ScheduleManager::default();
        let (worker, ack) = connect(manager.clone(), registration("cleanup", every("5 minutes"))).await;
        ack.unwrap();
        let _worker = worker.respond_with(|_| ClientMessage {
            id: String::new(),
            content: Some(client_message::Content::IntervalResponse(IntervalResponse {})),
        });

        let response = manager.handle_request(interval("cleanup")).await.unwrap();
        assert_eq!(response.id, "tick-1");
        assert!(matches!(
            response.content,
            Some(client_message::Content::IntervalResponse(_))
        ));
        assert_eq!(manager.cadence("cleanup"), every("5 minutes"));
    }

    #[tokio::test]
    async fn second_handler_for_a_schedule_is_rejected() {
        let manager = ScheduleManager::default();
        let (_first, ack) = connect(manager.clone(), registration("cleanup", None)).await;
        ack.unwrap();

        let cron = Some(Cadence::Cron(ScheduleCron {
            expression: "0 * * * *".to_string(),
        }));
        let (_second, reply) = connect(manager.clone(), registration("cleanup", cron)).await;
        let status = reply.unwrap_err();
        assert_eq!(status.code(), Code::AlreadyExists);
        assert_eq!(
            status.message(),
            "schedule handler already registered for schedule: cleanup"
        );
        assert_eq!(manager.worker_count(), 1);
        assert_eq!(manager.schedules(), vec![("cleanup".to_string(), None)]);
    }

    #[tokio::test]
    async fn missing_and_departed_handlers_are_routing_errors() {
        let manager = ScheduleManager::default();
        let err = manager.handle_request(interval("cleanup")).await.unwrap_err();
        assert_eq!(err.to_string(), "no worker registered for schedule: cleanup");

        let (worker, ack) = connect(manager.clone(), registration("cleanup", every("1 hour"))).await;
        ack.unwrap();
        drop(worker);
        eventually(|| manager.worker_count() == 0).await;
        assert!(manager.schedules().is_empty());

        let err = manager.handle_request(interval("cleanup")).await.unwrap_err();
        assert!(matches!(err, Error::NoWorker { .. }));
    }

    #[tokio::test]
    async fn listing_follows_registrations() {
        let manager = ScheduleManager::default();
        let (nightly, ack) = connect(manager.clone(), registration("nightly", every("1 day"))).await;
        ack.unwrap();
        let (_cleanup, ack) = connect(manager.clone(), registration("cleanup", None)).await;
        ack.unwrap();

        assert_eq!(manager.worker_count(), 2);
        assert_eq!(
            manager.schedules(),
            vec![
                ("cleanup".to_string(), None),
                ("nightly".to_string(), every("1 day")),
            ]
        );

        drop(nightly);
        eventually(|| manager.worker_count() == 1).await;
        assert_eq!(manager.schedules(), vec![("cleanup".to_string(), None)]);
        assert_eq!(manager.cadence("nightly"), None);
    }
}
