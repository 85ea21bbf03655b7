//! Bucket event listeners.
//!
//! A listener subscribes to one event type on one bucket for keys starting
//! with a prefix (`"*"` means every key). Two listeners on the same bucket
//! and event type may not have prefixes where either is a prefix of the
//! other, so for any key at most one listener can match.

use super::{
    WorkerConnection, WorkerCount, WorkerOptions, WorkerRegistry, WorkerStream, dispatch,
    serve_worker,
};
use membrane_core::{
    Error, Result,
    proto::storage::{
        BlobEventType, ClientMessage, RegistrationRequest, RegistrationResponse, ServerMessage,
        client_message, server_message, storage_listener_server::StorageListener,
    },
};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

pub type StorageWorker = WorkerConnection<ServerMessage, ClientMessage>;

/// Routes bucket events to storage listeners.
#[tonic::async_trait]
pub trait BucketRequestHandler: WorkerCount + Send + Sync {
    /// Forwards `request`, which must carry a blob event request, to the
    /// listener matching its bucket, event type and key.
    async fn handle_request(&self, request: ServerMessage) -> Result<ClientMessage>;
}

struct BucketListener {
    event_type: BlobEventType,
    key_prefix: String,
    worker: StorageWorker,
}

/// Whether either prefix starts with the other.
fn overlaps(prefix: &str, other: &str) -> bool {
    prefix.starts_with(other) || other.starts_with(prefix)
}

/// Manager for storage listeners, keyed by bucket name.
#[derive(Clone, Default)]
pub struct StorageListenerManager {
    buckets: Arc<RwLock<HashMap<String, Vec<BucketListener>>>>,
    options: WorkerOptions,
}

impl StorageListenerManager {
    pub fn new(options: WorkerOptions) -> Self {
        Self {
            buckets: Arc::default(),
            options,
        }
    }

    /// Listener for `key`. If several matched, the last registered one would
    /// win; overlap rejection keeps that from happening.
    fn find_listener(&self, bucket: &str, event_type: BlobEventType, key: &str) -> Result<StorageWorker> {
        let buckets = self.buckets.read();
        let matched = buckets.get(bucket).and_then(|listeners| {
            listeners
                .iter()
                .filter(|listener| listener.event_type == event_type)
                .filter(|listener| key.starts_with(&listener.key_prefix))
                .last()
        });

        matched
            .map(|listener| Arc::clone(&listener.worker))
            .ok_or_else(|| Error::NoWorker {
                context: format!(
                    "bucket {} and eventType {} with prefix matcher that matches blob key {}",
                    bucket,
                    event_type.as_str(),
                    key
                ),
            })
    }
}

impl WorkerCount for StorageListenerManager {
    fn worker_count(&self) -> usize {
        self.buckets.read().values().map(Vec::len).sum()
    }
}

impl WorkerRegistry for StorageListenerManager {
    type Request = ServerMessage;
    type Response = ClientMessage;
    type Registration = RegistrationRequest;

    const KIND: &'static str = "storage";

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

    fn register(&self, registration: RegistrationRequest, worker: StorageWorker) -> Result<()> {
        let event_type = registration.blob_event_type();
        let key_prefix = match registration.key_prefix_filter.as_str() {
            "*" => String::new(),
            prefix => prefix.to_owned(),
        };

        let mut buckets = self.buckets.write();
        let listeners = buckets.entry(registration.bucket_name.clone()).or_default();
        if let Some(existing) = listeners
            .iter()
            .filter(|listener| listener.event_type == event_type)
            .find(|listener| overlaps(&listener.key_prefix, &key_prefix))
        {
            let reason = format!(
                "overlapping listener key prefixes {} and {} for bucket '{}'",
                existing.key_prefix, key_prefix, registration.bucket_name
            );
            return Err(Error::RegistrationConflict { reason });
        }

        tracing::info!(
            bucket = %registration.bucket_name,
            event_type = event_type.as_str(),
            prefix = %key_prefix,
            "registering storage listener"
        );
        listeners.push(BucketListener {
            event_type,
            key_prefix,
            worker,
        });
        Ok(())
    }

    fn unregister(&self, worker: &StorageWorker) {
        let mut buckets = self.buckets.write();
        for listeners in buckets.values_mut() {
            listeners.retain(|listener| !Arc::ptr_eq(&listener.worker, worker));
        }
        buckets.retain(|_, listeners| !listeners.is_empty());
    }
}

#[tonic::async_trait]
impl BucketRequestHandler for StorageListenerManager {
    #[tracing::instrument(skip_all, fields(trigger = "storage"))]
    async fn handle_request(&self, request: ServerMessage) -> Result<ClientMessage> {
        let Some(server_message::Content::BlobEventRequest(event)) = request.content.as_ref() else {
            return Err(Error::InvalidRequest {
                reason: "storage requests must carry a blob event request".to_string(),
            });
        };
        let Some(blob) = event.blob_event.as_ref() else {
            return Err(Error::InvalidRequest {
                reason: "blob event request is missing its event".to_string(),
            });
        };

        let worker = self.find_listener(&event.bucket_name, blob.event_type(), &blob.key)?;
        dispatch(Self::KIND, &worker, request, self.options.request_timeout).await
    }
}

#[tonic::async_trait]
impl StorageListener for StorageListenerManager {
    type ListenStream = WorkerStream<ServerMessage>;

    async fn listen(
        &self,
        request: Request<Streaming<ClientMessage>>,
    ) -> core::result::Result<Response<Self::ListenStream>, Status> {
        let (tx, rx) = mpsc::channel(self.options.stream_buffer_size);
        tokio::spawn(serve_worker(self.clone(), request.into_inner(), tx));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::workers::testing::{connect, eventually};
    use membrane_core::proto::storage::{BlobEvent, BlobEventRequest, BlobEventResponse};
    use tokio::task::JoinHandle;
    use tonic::Code;

    fn registration(bucket: &str, event_type: BlobEventType, prefix: &str) -> ClientMessage {
        ClientMessage {
            id: String::new(),
            content: Some(client_message::Content::RegistrationRequest(
                RegistrationRequest {
                    bucket_name: bucket.to_string(),
                    blob_event_type: event_type as i32,
                    key_prefix_filter: prefix.to_string(),
                },
            )),
        }
    }

    fn event(bucket: &str, event_type: BlobEventType, key: &str) -> ServerMessage {
        ServerMessage {
            id: String::new(),
            content: Some(server_message::Content::BlobEventRequest(BlobEventRequest {
                bucket_name: bucket.to_string(),
                blob_event: Some(BlobEvent {
                    key: key.to_string(),
                    event_type: event_type as i32,
                }),
            })),
        }
    }

    /// Connects a listener that reports `success` on every event.
    async fn listen(
        manager: &StorageListenerManager,
        bucket: &str,
        event_type: BlobEventType,
        prefix: &str,
        success: bool,
    ) -> core::result::Result<JoinHandle<()>, Status> {
        let (worker, first) = connect(manager.clone(), registration(bucket, event_type, prefix)).await;
        first?;
        Ok(worker.respond_with(move |_| ClientMessage {
            id: String::new(),
            content: Some(client_message::Content::BlobEventResponse(
                BlobEventResponse { success },
            )),
        }))
    }

    fn succeeded(message: &ClientMessage) -> bool {
        matches!(
            message.content,
            Some(client_message::Content::BlobEventResponse(BlobEventResponse { success: true }))
        )
    }

    #[tokio::test]
    async fn disjoint_prefixes_route_independently() {
        let manager = StorageListenerManager::default();
        let _images = listen(&manager, "media", BlobEventType::Created, "images/", true)
            .await
            .unwrap();
        let _videos = listen(&manager, "media", BlobEventType::Created, "videos/", false)
            .await
            .unwrap();
        assert_eq!(manager.worker_count(), 2);

        let response = manager
            .handle_request(event("media", BlobEventType::Created, "images/cat.png"))
            .await
            .unwrap();
        assert!(succeeded(&response));

        let response = manager
            .handle_request(event("media", BlobEventType::Created, "videos/cat.mp4"))
            .await
            .unwrap();
        assert!(!succeeded(&response));
    }

    #[tokio::test]
    async fn overlapping_prefixes_are_rejected() {
        let manager = StorageListenerManager::default();
        let _images = listen(&manager, "media", BlobEventType::Created, "images/", true)
            .await
            .unwrap();

        let status = listen(&manager, "media", BlobEventType::Created, "images/thumb/", true)
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::AlreadyExists);
        assert_eq!(
            status.message(),
            "overlapping listener key prefixes images/ and images/thumb/ for bucket 'media'"
        );

        let status = listen(&manager, "media", BlobEventType::Created, "*", true)
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::AlreadyExists);
        assert_eq!(manager.worker_count(), 1);
    }

    #[tokio::test]
    async fn event_types_and_buckets_do_not_conflict() {
        let manager = StorageListenerManager::default();
        let _created = listen(&manager, "media", BlobEventType::Created, "*", true)
            .await
            .unwrap();
        let _deleted = listen(&manager, "media", BlobEventType::Deleted, "*", false)
            .await
            .unwrap();
        let _other = listen(&manager, "backups", BlobEventType::Created, "*", true)
            .await
            .unwrap();
        assert_eq!(manager.worker_count(), 3);

        let response = manager
            .handle_request(event("media", BlobEventType::Deleted, "anything"))
            .await
            .unwrap();
        assert!(!succeeded(&response));
    }

    #[tokio::test]
    async fn unmatched_keys_are_routing_errors() {
        let manager = StorageListenerManager::default();
        let _images = listen(&manager, "media", BlobEventType::Created, "images/", true)
            .await
            .unwrap();

        for request in [
            event("media", BlobEventType::Created, "docs/readme.md"),
            event("media", BlobEventType::Deleted, "images/cat.png"),
            event("missing", BlobEventType::Created, "images/cat.png"),
        ] {
            let err = manager.handle_request(request).await.unwrap_err();
            assert!(matches!(err, Error::NoWorker { .. }));
        }
    }

    #[tokio::test]
    async fn disconnecting_frees_the_prefix() {
        let manager = StorageListenerManager::default();
        let images = listen(&manager, "media", BlobEventType::Created, "images/", true)
            .await
            .unwrap();
        images.abort();
        eventually(|| manager.worker_count() == 0).await;

        let _thumbs = listen(&manager, "media", BlobEventType::Created, "images/thumb/", true)
            .await
            .unwrap();
        let err = manager
            .handle_request(event("media", BlobEventType::Created, "images/cat.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoWorker { .. }));
    }
}
