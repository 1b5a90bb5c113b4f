//! Opaque events flowing back from the native worker.

use serde::{Deserialize, Serialize};

use crate::ids::{ClientId, QueryId};

/// Error code of the synthetic response delivered to requests still pending
/// when their client closes.
pub const CLOSED_ERROR_CODE: i32 = 500;
pub const CLOSED_ERROR_MESSAGE: &str = "Instance closed";

/// Message the native layer attaches to requests it aborted while closing a
/// client. Seeing one for an unknown client is expected and not a drop.
pub const REQUEST_ABORTED_MESSAGE: &str = "Request aborted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub code: i32,
    pub message: String,
}

/// A response or update. The payload `P` is never inspected by the
/// dispatcher; only the `Ok` and `Error` variants carry meaning here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event<P> {
    Ok,
    Error(ErrorEvent),
    Object(P),
}

impl<P> Event<P> {
    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Event::Error(ErrorEvent {
            code,
            message: message.into(),
        })
    }

    /// Terminal error handed to requests that were outstanding at closure.
    pub fn closed() -> Self {
        Self::error(CLOSED_ERROR_CODE, CLOSED_ERROR_MESSAGE)
    }

    pub fn as_error(&self) -> Option<&ErrorEvent> {
        match self {
            Event::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Event::Ok)
    }

    pub fn is_request_aborted(&self) -> bool {
        self.as_error()
            .is_some_and(|err| err.message == REQUEST_ABORTED_MESSAGE)
    }
}

/// One delivery from the native boundary for a single client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch<P> {
    pub client_id: ClientId,
    pub is_closed: bool,
    pub events: Vec<(QueryId, Event<P>)>,
}

impl<P> EventBatch<P> {
    pub fn new(client_id: ClientId, events: Vec<(QueryId, Event<P>)>) -> Self {
        Self {
            client_id,
            is_closed: false,
            events,
        }
    }

    pub fn closing(client_id: ClientId, events: Vec<(QueryId, Event<P>)>) -> Self {
        Self {
            client_id,
            is_closed: true,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_aborted_detection() {
        let aborted: Event<()> = Event::error(500, "Request aborted");
        assert!(aborted.is_request_aborted());

        let other: Event<()> = Event::error(500, "Something else");
        assert!(!other.is_request_aborted());

        assert!(!Event::<()>::Ok.is_request_aborted());
        assert!(!Event::Object(()).is_request_aborted());
    }

    #[test]
    fn closed_event_shape() {
        let event: Event<String> = Event::closed();
        let err = event.as_error().unwrap();
        assert_eq!(err.code, 500);
        assert_eq!(err.message, "Instance closed");
    }

    #[test]
    fn closing_batch_flag() {
        let batch: EventBatch<()> = EventBatch::closing(ClientId(1), vec![]);
        assert!(batch.is_closed);
        assert!(batch.is_empty());
        assert!(!EventBatch::<()>::new(ClientId(1), vec![]).is_closed);
    }
}
