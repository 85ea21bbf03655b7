//! Error types for the membrane worker protocol.
//!
//! This module defines the central `Error` enum shared by the request broker
//! and every resource manager. It implements `From<Error>` for
//! `tonic::Status` so that failures on a worker stream surface to the worker
//! with a meaningful status code.
//!
//! ## Error Cases
//! - Registration: `MissingRegistration`, `RegistrationConflict`.
//! - Routing: `NoWorker`, `InvalidRequest`.
//! - Correlation: `BrokerNotRunning`, `BrokerAlreadyRunning`,
//!   `DuplicateRequestId`, `RequestTimeout`, `WorkerDisconnected`.
//! - Transport: `Stream`.

use core::time::Duration;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the worker protocol.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The first message on a worker stream was not a registration request.
    #[error("first message on a worker stream must be a registration request")]
    MissingRegistration,

    /// The requested routing key is already taken or overlaps an existing one.
    #[error("{reason}")]
    RegistrationConflict { reason: String },

    /// No registered worker matches the trigger.
    #[error("no worker registered for {context}")]
    NoWorker { context: String },

    /// The trigger was malformed for the manager it was sent to.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// `send` was called before the broker started its receive loop.
    #[error("request broker is not running")]
    BrokerNotRunning,

    /// The receive loop was started a second time.
    #[error("request broker is already running")]
    BrokerAlreadyRunning,

    /// A request with the same correlation ID is still waiting for a response.
    #[error("request with ID {id} already exists")]
    DuplicateRequestId { id: String },

    /// No response arrived before the deadline.
    #[error("request {id} timed out after {timeout:?}")]
    RequestTimeout { id: String, timeout: Duration },

    /// The worker stream closed before a response was delivered.
    #[error("worker disconnected before responding")]
    WorkerDisconnected,

    /// The worker stream yielded an error.
    #[error("stream error: {0}")]
    Stream(Status),
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::MissingRegistration => Status::failed_precondition(err.to_string()),
            Error::RegistrationConflict { reason } => Status::already_exists(reason),
            Error::NoWorker { .. } => Status::not_found(err.to_string()),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::BrokerNotRunning | Error::WorkerDisconnected => {
                Status::unavailable(err.to_string())
            }
            Error::BrokerAlreadyRunning => Status::failed_precondition(err.to_string()),
            Error::DuplicateRequestId { .. } => Status::already_exists(err.to_string()),
            Error::RequestTimeout { .. } => Status::deadline_exceeded(err.to_string()),
            Error::Stream(status) => status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn routing_errors_map_to_not_found() {
        let status = Status::from(Error::NoWorker {
            context: "job: nightly".to_string(),
        });
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "no worker registered for job: nightly");
    }

    #[test]
    fn registration_errors_map_to_precondition_and_conflict() {
        assert_eq!(
            Status::from(Error::MissingRegistration).code(),
            Code::FailedPrecondition
        );
        let status = Status::from(Error::RegistrationConflict {
            reason: "taken".to_string(),
        });
        assert_eq!(status.code(), Code::AlreadyExists);
        assert_eq!(status.message(), "taken");
    }

    #[test]
    fn stream_status_passes_through() {
        let status = Status::from(Error::Stream(Status::aborted("gone")));
        assert_eq!(status.code(), Code::Aborted);
        assert_eq!(status.message(), "gone");
    }

    #[test]
    fn correlation_errors_map_to_transport_codes() {
        assert_eq!(Status::from(Error::BrokerNotRunning).code(), Code::Unavailable);
        assert_eq!(Status::from(Error::WorkerDisconnected).code(), Code::Unavailable);
        assert_eq!(
            Status::from(Error::BrokerAlreadyRunning).code(),
            Code::FailedPrecondition
        );
        let status = Status::from(Error::RequestTimeout {
            id: "slow".to_string(),
            timeout: Duration::from_secs(2),
        });
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert_eq!(status.message(), "request slow timed out after 2s");
    }
}
