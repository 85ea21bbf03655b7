//! `membrane.apis.v1`: HTTP API workers.

use std::collections::HashMap;

/// Worker to membrane.
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
        HttpResponse(super::HttpResponse),
    }
}

/// Membrane to worker.
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
        HttpRequest(super::HttpRequest),
    }
}

/// Declares the routes a worker serves for one API.
///
/// `path` is a template whose `:name` segments capture path parameters, e.g.
/// `/pets/:id`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistrationRequest {
    #[prost(string, tag = "1")]
    pub api: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(string, repeated, tag = "3")]
    pub methods: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistrationResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeaderValue {
    #[prost(string, repeated, tag = "1")]
    pub value: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryValue {
    #[prost(string, repeated, tag = "1")]
    pub value: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpRequest {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(map = "string, message", tag = "3")]
    pub headers: HashMap<String, HeaderValue>,
    #[prost(map = "string, message", tag = "4")]
    pub query_params: HashMap<String, QueryValue>,
    #[prost(bytes = "bytes", tag = "5")]
    pub body: ::prost::bytes::Bytes,
    #[prost(map = "string, string", tag = "6")]
    pub path_params: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HttpResponse {
    #[prost(int32, tag = "1")]
    pub status: i32,
    #[prost(map = "string, message", tag = "2")]
    pub headers: HashMap<String, HeaderValue>,
    #[prost(bytes = "bytes", tag = "3")]
    pub body: ::prost::bytes::Bytes,
}

include!(concat!(env!("OUT_DIR"), "/membrane.apis.v1.Api.rs"));
