//! `membrane.batch.v1`: batch job handlers.

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
        JobResponse(super::JobResponse),
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
        JobRequest(super::JobRequest),
    }
}

/// Resources a job asks the platform to provision.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobResourceRequirements {
    #[prost(float, tag = "1")]
    pub cpus: f32,
    #[prost(int64, tag = "2")]
    pub memory: i64,
    #[prost(int64, tag = "3")]
    pub gpus: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistrationRequest {
    #[prost(string, tag = "1")]
    pub job_name: String,
    #[prost(message, optional, tag = "2")]
    pub requirements: Option<JobResourceRequirements>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistrationResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobRequest {
    #[prost(string, tag = "1")]
    pub job_name: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub data: ::prost::bytes::Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

include!(concat!(env!("OUT_DIR"), "/membrane.batch.v1.Job.rs"));
