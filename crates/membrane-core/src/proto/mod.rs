//! Messages and gRPC stubs for the worker-facing services.
//!
//! Each submodule mirrors one protobuf package. Every package defines a
//! `ClientMessage` (worker to membrane) and a `ServerMessage` (membrane to
//! worker), both carrying a correlation `id` and a `content` oneof whose
//! first variant is the registration handshake.

pub mod apis;
pub mod batch;
pub mod schedules;
pub mod storage;
pub mod topics;
pub mod websockets;

use crate::types::{IdentifiableMessage, RequestId};

macro_rules! impl_identifiable {
    ($($ty:path),* $(,)?) => {
        $(
            impl IdentifiableMessage for $ty {
                fn id(&self) -> &str {
                    &self.id
                }

                fn set_id(&mut self, id: RequestId) {
                    self.id = id;
                }
            }
        )*
    };
}

impl_identifiable!(
    apis::ClientMessage,
    apis::ServerMessage,
    batch::ClientMessage,
    batch::ServerMessage,
    schedules::ClientMessage,
    schedules::ServerMessage,
    storage::ClientMessage,
    storage::ServerMessage,
    topics::ClientMessage,
    topics::ServerMessage,
    websockets::ClientMessage,
    websockets::ServerMessage,
);
