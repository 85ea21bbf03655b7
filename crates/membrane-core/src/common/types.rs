//! # Correlation Types
//!
//! Every message exchanged over a worker stream carries a correlation ID.
//! The membrane tags each request it pushes to a worker with an ID, and the
//! worker echoes that ID on its response so the broker can hand the response
//! back to whichever caller is waiting on it.
//!
//! ## Overview
//!
//! - [`RequestId`] - the string form of a correlation ID
//! - [`IdentifiableMessage`] - read/write access to a message's ID
//! - [`new_request_id`] - server-side ID generation
//!
//! IDs supplied by the caller are kept as-is; blank IDs are replaced with a
//! freshly generated ULID before the request is sent.

use ferroid::generator::thread_local::Ulid;

/// Correlation ID attached to every worker message.
pub type RequestId = String;

/// A message that carries a correlation ID.
pub trait IdentifiableMessage {
    /// Returns the correlation ID, which may be empty.
    fn id(&self) -> &str;

    /// Replaces the correlation ID.
    fn set_id(&mut self, id: RequestId);

    /// Fills in a generated ID when none was supplied and returns the ID in
    /// use.
    fn ensure_id(&mut self) -> RequestId {
        if self.id().is_empty() {
            self.set_id(new_request_id());
        }
        self.id().to_owned()
    }
}

/// Generates a fresh correlation ID.
///
/// IDs are ULIDs rendered in Crockford base32, so they sort by creation time
/// and are unique across threads without coordination.
#[must_use]
pub fn new_request_id() -> RequestId {
    Ulid::new_ulid().to_string()
}
