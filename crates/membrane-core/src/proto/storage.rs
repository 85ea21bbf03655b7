//! `membrane.storage.v1`: bucket event listeners.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(oneof = "client_message::Content", tags = "2, 3")]
    pub content: Option<client_message::Content>,
}

pub mod client_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "2")]
        RegistrationRequest(super::RegistrationRequest),
        #[prost(message, tag = "3")]
        BlobEventResponse(super::BlobEventResponse),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(oneof = "server_message::Content", tags = "2, 3")]
    pub content: Option<server_message::Content>,
}

pub mod server_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "2")]
        RegistrationResponse(super::RegistrationResponse),
        #[prost(message, tag = "3")]
        BlobEventRequest(super::BlobEventRequest),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum BlobEventType {
    Created = 0,
    Deleted = 1,
}

impl BlobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobEventType::Created => "Created",
            BlobEventType::Deleted => "Deleted",
        }
    }
}

/// Subscribes a worker to events on keys starting with `key_prefix_filter`.
///
/// A filter of `"*"` matches every key in the bucket.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistrationRequest {
    #[prost(string, tag = "1")]
    pub bucket_name: String,
    #[prost(enumeration = "BlobEventType", tag = "2")]
    pub blob_event_type: i32,
    #[prost(string, tag = "3")]
    pub key_prefix_filter: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistrationResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlobEvent {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(enumeration = "BlobEventType", tag = "2")]
    pub event_type: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlobEventRequest {
    #[prost(string, tag = "1")]
    pub bucket_name: String,
    #[prost(message, optional, tag = "2")]
    pub blob_event: Option<BlobEvent>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlobEventResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

include!(concat!(
    env!("OUT_DIR"),
    "/membrane.storage.v1.StorageListener.rs"
));
