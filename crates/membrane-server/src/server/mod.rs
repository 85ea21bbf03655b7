//! Runtime components of the membrane.
//!
//! ## Structure
//!
//! - [`broker`] - request/response correlation over one worker stream.
//! - [`workers`] - per-trigger managers owning worker registrations.
//! - [`membrane`] - the orchestrator tying managers, gateway and child process
//!   together.
//! - [`gateway`] - the ingress plugin contract and a local development gateway.
//! - [`process`] - child process lifecycle.
//! - [`config`] - command line and environment configuration.
//! - [`telemetry`] - logging, tracing and metrics setup.

pub mod broker;
pub mod config;
pub mod gateway;
pub mod membrane;
pub mod process;
pub mod telemetry;
pub mod workers;
