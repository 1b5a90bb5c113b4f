//! Boundary to the native messaging worker.
//!
//! Everything on the other side of this trait is opaque: how clients are
//! created, how requests are encoded and how the event stream is produced.
//! Each platform supplies its own implementation; [`crate::loopback`] is an
//! in-memory one.

use std::fmt;
use std::time::Duration;

use crate::error::TransportError;
use crate::event::{Event, EventBatch};
use crate::ids::{ClientId, QueryId};

/// A request understood by the native layer.
pub trait Request: fmt::Debug + Send + 'static {
    /// Whether this request asks the native client to close. Close requests
    /// are still forwarded after the client is already closed.
    fn is_close(&self) -> bool;

    /// A benign, idempotent query issued right after client creation.
    fn warm_up() -> Self;
}

pub trait Transport: Send + Sync + 'static {
    type Query: Request;
    type Payload: fmt::Debug + Send + 'static;

    /// One-time process-level setup (library loading and the like). Called
    /// exactly once when a [`ClientManager`](crate::ClientManager) starts.
    fn start(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Create a native client and return the id it will be addressed by.
    fn create(&self) -> Result<ClientId, TransportError>;

    /// Fire-and-forget. The response arrives later through [`receive`](Self::receive)
    /// tagged with `query_id`.
    fn send(
        &self,
        client_id: ClientId,
        query_id: QueryId,
        query: Self::Query,
    ) -> Result<(), TransportError>;

    /// Run a query synchronously. Failures come back in-band as
    /// [`Event::Error`].
    fn execute(&self, query: Self::Query) -> Event<Self::Payload>;

    /// Wait up to `timeout` for pending events. An empty vector means the
    /// timeout elapsed. Batches for the same client must come out in order.
    fn receive(&self, timeout: Duration) -> Result<Vec<EventBatch<Self::Payload>>, TransportError>;
}
