//! Websocket event handlers.
//!
//! Exactly one worker handles each (socket, event type) pair. Handlers are
//! keyed by the lower-cased `"{socket}-{event}"` string, so socket names
//! differing only in case share a key.

use super::{
    NamedWorkers, WorkerConnection, WorkerCount, WorkerOptions, WorkerRegistry, WorkerStream,
    dispatch, serve_worker,
};
use membrane_core::{
    Error, Result,
    proto::websockets::{
        ClientMessage, RegistrationRequest, RegistrationResponse, ServerMessage,
        WebsocketEventType, client_message, server_message,
        websocket_handler_server::WebsocketHandler,
    },
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

pub type WebsocketWorker = WorkerConnection<ServerMessage, ClientMessage>;

/// Routes websocket connection, message and disconnection events.
#[tonic::async_trait]
pub trait WebsocketRequestHandler: WorkerCount + Send + Sync {
    /// Forwards `request`, which must carry a websocket event request, to the
    /// handler for its socket and event type.
    async fn handle_request(&self, request: ServerMessage) -> Result<ClientMessage>;
}

fn handler_key(socket: &str, event_type: WebsocketEventType) -> String {
    format!("{}-{}", socket, event_type.as_str()).to_lowercase()
}

/// Manager for websocket handlers.
#[derive(Clone, Default)]
pub struct WebsocketManager {
    handlers: Arc<NamedWorkers<ServerMessage, ClientMessage>>,
    options: WorkerOptions,
}

impl WebsocketManager {
    pub fn new(options: WorkerOptions) -> Self {
        Self {
            handlers: Arc::default(),
            options,
        }
    }
}

impl WorkerCount for WebsocketManager {
    fn worker_count(&self) -> usize {
        self.handlers.len()
    }
}

impl WorkerRegistry for WebsocketManager {
    type Request = ServerMessage;
    type Response = ClientMessage;
    type Registration = RegistrationRequest;

    const KIND: &'static str = "websocket";

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

    fn register(&self, registration: RegistrationRequest, worker: WebsocketWorker) -> Result<()> {
        let event_type = registration.event_type();
        let key = handler_key(&registration.socket_name, event_type);
        self.handlers.insert(key, worker, |_| {
            format!(
                "websocket handler already registered, socket: {} eventType: {}",
                registration.socket_name,
                event_type.as_str()
            )
        })?;
        tracing::info!(
            socket = %registration.socket_name,
            event_type = event_type.as_str(),
            "registering websocket handler"
        );
        Ok(())
    }

    fn unregister(&self, worker: &WebsocketWorker) {
        self.handlers.remove_worker(worker);
    }
}

#[tonic::async_trait]
impl WebsocketRequestHandler for WebsocketManager {
    #[tracing::instrument(skip_all, fields(trigger = "websocket"))]
    async fn handle_request(&self, request: ServerMessage) -> Result<ClientMessage> {
        let Some(server_message::Content::WebsocketEventRequest(event)) = request.content.as_ref()
        else {
            return Err(Error::InvalidRequest {
                reason: "websocket requests must carry a websocket event request".to_string(),
            });
        };

        let event_type = event.event_type();
        let worker = self
            .handlers
            .get(&handler_key(&event.socket_name, event_type))
            .ok_or_else(|| Error::NoWorker {
                context: format!(
                    "socket: {} and eventType: {}",
                    event.socket_name,
                    event_type.as_str()
                ),
            })?;
        dispatch(Self::KIND, &worker, request, self.options.request_timeout).await
    }
}

#[tonic::async_trait]
impl WebsocketHandler for WebsocketManager {
    type HandleEventsStream = WorkerStream<ServerMessage>;

    async fn handle_events(
        &self,
        request: Request<Streaming<ClientMessage>>,
    ) -> core::result::Result<Response<Self::HandleEventsStream>, Status> {
        let (tx, rx) = mpsc::channel(self.options.stream_buffer_size);
        tokio::spawn(serve_worker(self.clone(), request.into_inner(), tx));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
