//! `membrane.schedules.v1`: scheduled interval handlers.

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
        IntervalResponse(super::IntervalResponse),
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
        IntervalRequest(super::IntervalRequest),
    }
}

/// Fixed rate such as `"5 minutes"`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScheduleEvery {
    #[prost(string, tag = "1")]
    pub rate: String,
}

/// Cron expression such as `"0 * * * *"`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScheduleCron {
    #[prost(string, tag = "1")]
    pub expression: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistrationRequest {
    #[prost(string, tag = "1")]
    pub schedule_name: String,
    #[prost(oneof = "registration_request::Cadence", tags = "10, 11")]
    pub cadence: Option<registration_request::Cadence>,
}

pub mod registration_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Cadence {
        #[prost(message, tag = "10")]
        Every(super::ScheduleEvery),
        #[prost(message, tag = "11")]
        Cron(super::ScheduleCron),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegistrationResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IntervalRequest {
    #[prost(string, tag = "1")]
    pub schedule_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IntervalResponse {}

include!(concat!(env!("OUT_DIR"), "/membrane.schedules.v1.Schedules.rs"));
