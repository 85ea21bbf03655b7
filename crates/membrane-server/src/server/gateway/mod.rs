//! Ingress plugins.
//!
//! A [`Gateway`] receives external triggers (HTTP calls, queue messages,
//! bucket notifications, timers, socket frames) and hands each one to the
//! manager responsible for it through [`GatewayHandlers`], translating the
//! worker's reply back into whatever the trigger source expects.
//!
//! - [`dev`] - a local HTTP gateway for running an application on a
//!   workstation.

pub mod dev;

use crate::server::workers::{
    apis::ApiRequestHandler, jobs::JobRequestHandler, schedules::ScheduleRequestHandler,
    storage::BucketRequestHandler, topics::SubscriptionRequestHandler,
    websockets::WebsocketRequestHandler,
};
use std::sync::Arc;

/// The managers a gateway dispatches to.
#[derive(Clone)]
pub struct GatewayHandlers {
    pub apis: Arc<dyn ApiRequestHandler>,
    pub storage: Arc<dyn BucketRequestHandler>,
    pub topics: Arc<dyn SubscriptionRequestHandler>,
    pub websockets: Arc<dyn WebsocketRequestHandler>,
    pub schedules: Arc<dyn ScheduleRequestHandler>,
    pub jobs: Arc<dyn JobRequestHandler>,
}

/// Cloud or local ingress adapter.
#[tonic::async_trait]
pub trait Gateway: Send + Sync {
    /// Serves triggers until the gateway is stopped or fails.
    ///
    /// Returning `Ok(())` means the gateway shut down cleanly.
    async fn start(&self, handlers: GatewayHandlers) -> anyhow::Result<()>;

    /// Asks a running gateway to stop; `start` then returns.
    async fn stop(&self) -> anyhow::Result<()>;
}
