//! Topic subscriptions.
//!
//! Any number of workers may subscribe to a topic. A published message is
//! delivered to every subscriber concurrently and the publish succeeds only if
//! all of them report success. Subscribers are expected to be idempotent, so a
//! failed publish can be retried as a whole.

use super::{
    WorkerConnection, WorkerCount, WorkerOptions, WorkerRegistry, WorkerStream, dispatch,
    serve_worker,
};
use futures::future::try_join_all;
use membrane_core::{
    Error, Result,
    proto::topics::{
        ClientMessage, MessageResponse, RegistrationRequest, RegistrationResponse, ServerMessage,
        client_message, server_message, subscriber_server::Subscriber,
    },
    types::IdentifiableMessage,
};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

pub type TopicWorker = WorkerConnection<ServerMessage, ClientMessage>;

/// Delivers published messages to topic subscribers.
#[tonic::async_trait]
pub trait SubscriptionRequestHandler: WorkerCount + Send + Sync {
    /// Fans `request`, which must carry a message request, out to every
    /// subscriber of its topic and answers with the combined outcome.
    ///
    /// # Errors
    ///
    /// Fails if any single delivery fails; no partial result is returned.
    async fn handle_request(&self, request: ServerMessage) -> Result<ClientMessage>;
}

/// Manager for topic subscribers, keyed by topic name.
#[derive(Clone, Default)]
pub struct SubscriberManager {
    topics: Arc<RwLock<HashMap<String, Vec<TopicWorker>>>>,
    options: WorkerOptions,
}

impl SubscriberManager {
    pub fn new(options: WorkerOptions) -> Self {
        Self {
            topics: Arc::default(),
            options,
        }
    }

    fn subscribers(&self, topic: &str) -> Result<Vec<TopicWorker>> {
        self.topics
            .read()
            .get(topic)
            .filter(|subscribers| !subscribers.is_empty())
            .cloned()
            .ok_or_else(|| Error::NoWorker {
                context: format!("topic subscription: {}", topic),
            })
    }
}

impl WorkerCount for SubscriberManager {
    fn worker_count(&self) -> usize {
        self.topics.read().values().map(Vec::len).sum()
    }
}

impl WorkerRegistry for SubscriberManager {
    type Request = ServerMessage;
    type Response = ClientMessage;
    type Registration = RegistrationRequest;

    const KIND: &'static str = "topic";

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

    fn register(&self, registration: RegistrationRequest, worker: TopicWorker) -> Result<()> {
        tracing::info!(topic = %registration.topic_name, "registering subscriber");
        self.topics
            .write()
            .entry(registration.topic_name)
            .or_default()
            .push(worker);
        Ok(())
    }

    fn unregister(&self, worker: &TopicWorker) {
        let mut topics = self.topics.write();
        for subscribers in topics.values_mut() {
            subscribers.retain(|subscriber| !Arc::ptr_eq(subscriber, worker));
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());
    }
}

#[tonic::async_trait]
impl SubscriptionRequestHandler for SubscriberManager {
    #[tracing::instrument(skip_all, fields(trigger = "topic"))]
    async fn handle_request(&self, mut request: ServerMessage) -> Result<ClientMessage> {
        let Some(server_message::Content::MessageRequest(message)) = request.content.as_ref() else {
            return Err(Error::InvalidRequest {
                reason: "topic requests must carry a message request".to_string(),
            });
        };
        let subscribers = self.subscribers(&message.topic_name)?;
        // Every subscriber has its own stream, so the one ID is reused.
        let id = request.ensure_id();

        let deliveries = subscribers.iter().map(|subscriber| {
            dispatch(
                Self::KIND,
                subscriber,
                request.clone(),
                self.options.request_timeout,
            )
        });
        let responses = try_join_all(deliveries).await?;

        let success = responses.iter().all(|response| {
            matches!(
                response.content,
                Some(client_message::Content::MessageResponse(MessageResponse { success: true }))
            )
        });
        tracing::debug!(subscribers = responses.len(), success, "published message");

        Ok(ClientMessage {
            id,
            content: Some(client_message::Content::MessageResponse(MessageResponse {
                success,
            })),
        })
    }
}

#[tonic::async_trait]
impl Subscriber for SubscriberManager {
    type SubscribeStream = WorkerStream<ServerMessage>;

    async fn subscribe(
        &self,
        request: Request<Streaming<ClientMessage>>,
    ) -> core::result::Result<Response<Self::SubscribeStream>, Status> {
        let (tx, rx) = mpsc::channel(self.options.stream_buffer_size);
        tokio::spawn(serve_worker(self.clone(), request.into_inner(), tx));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
