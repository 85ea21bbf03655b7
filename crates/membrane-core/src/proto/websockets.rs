//! `membrane.websockets.v1`: websocket event handlers.

use std::collections::HashMap;

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
        WebsocketEventResponse(super::WebsocketEventResponse),
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
        WebsocketEventRequest(super::WebsocketEventRequest),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WebsocketEventType {
    Connect = 0,
    Disconnect = 1,
    Message = 2,
}

impl WebsocketEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebsocketEventType::Connect => "Connect",
            WebsocketEventType::Disconnect => "Disconnect",
            WebsocketEventType::Message => "Message",
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistrationRequest {
    #[prost(string, tag = "1")]
    pub socket_name: String,
    #[prost(enumeration = "WebsocketEventType", tag = "2")]
    pub event_type: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistrationResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryValue {
    #[prost(string, repeated, tag = "1")]
    pub value: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WebsocketConnectionEvent {
    #[prost(map = "string, message", tag = "1")]
    pub query_params: HashMap<String, QueryValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WebsocketDisconnectionEvent {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WebsocketMessageEvent {
    #[prost(bytes = "bytes", tag = "1")]
    pub body: ::prost::bytes::Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WebsocketEventRequest {
    #[prost(string, tag = "1")]
    pub socket_name: String,
    #[prost(string, tag = "2")]
    pub connection_id: String,
    #[prost(oneof = "websocket_event_request::WebsocketEvent", tags = "3, 4, 5")]
    pub websocket_event: Option<websocket_event_request::WebsocketEvent>,
}

pub mod websocket_event_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum WebsocketEvent {
        #[prost(message, tag = "3")]
        Connection(super::WebsocketConnectionEvent),
        #[prost(message, tag = "4")]
        Disconnection(super::WebsocketDisconnectionEvent),
        #[prost(message, tag = "5")]
        Message(super::WebsocketMessageEvent),
    }
}

impl WebsocketEventRequest {
    /// Event type implied by the request's content.
    ///
    /// Requests without a disconnection or message payload are treated as
    /// connection attempts.
    pub fn event_type(&self) -> WebsocketEventType {
        use websocket_event_request::WebsocketEvent;

        match self.websocket_event {
            Some(WebsocketEvent::Disconnection(_)) => WebsocketEventType::Disconnect,
            Some(WebsocketEvent::Message(_)) => WebsocketEventType::Message,
            Some(WebsocketEvent::Connection(_)) | None => WebsocketEventType::Connect,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WebsocketConnectionResponse {
    #[prost(bool, tag = "1")]
    pub reject: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WebsocketEventResponse {
    #[prost(message, optional, tag = "1")]
    pub connection_response: Option<WebsocketConnectionResponse>,
}

include!(concat!(
    env!("OUT_DIR"),
    "/membrane.websockets.v1.WebsocketHandler.rs"
));
