//! Handler callbacks and the per-client table of outstanding requests.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::event::Event;
use crate::ids::QueryId;

/// Handlers report failure by returning an error; panics are converted to
/// errors as well.
pub type HandlerResult = anyhow::Result<()>;

pub type ExceptionHandler = Arc<dyn Fn(anyhow::Error) + Send + Sync>;

/// One-shot handler for the response to a single request.
pub(crate) type ResultHandler<P> = Box<dyn FnOnce(Event<P>) -> HandlerResult + Send + Sync>;

/// Handler called once per event with id 0 in single-handler mode.
pub(crate) type UpdateHandler<P> = Arc<dyn Fn(Event<P>) -> HandlerResult + Send + Sync>;

/// Handler called once per batch with every update in it.
pub(crate) type UpdatesHandler<P> = Arc<dyn Fn(Vec<Event<P>>) -> HandlerResult + Send + Sync>;

pub(crate) struct PendingRequest<P> {
    pub result_handler: ResultHandler<P>,
    pub exception_handler: Option<ExceptionHandler>,
}

impl<P> PendingRequest<P> {
    pub fn new(result_handler: ResultHandler<P>, exception_handler: Option<ExceptionHandler>) -> Self {
        Self {
            result_handler,
            exception_handler,
        }
    }
}

/// How a client receives events that nobody asked for. Chosen once at
/// initialization.
pub(crate) enum DispatchMode<P> {
    /// Updates are collected per batch and handed over in one call.
    Updates {
        handler: UpdatesHandler<P>,
        exception_handler: Option<ExceptionHandler>,
    },
    /// Every event is a response; id 0 goes to this default handler.
    SingleHandler {
        handler: UpdateHandler<P>,
        exception_handler: Option<ExceptionHandler>,
    },
}

impl<P> DispatchMode<P> {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            DispatchMode::Updates { .. } => "updates",
            DispatchMode::SingleHandler { .. } => "single-handler",
        }
    }
}

/// Outstanding requests of one client, keyed by query id.
///
/// Registration happens on request-issuing threads while removal happens on
/// the receiver thread, so every operation is atomic per key. A pending
/// request can be removed only once, which is what makes delivery
/// exactly-once.
pub(crate) struct HandlerRegistry<P> {
    pending: DashMap<QueryId, PendingRequest<P>>,
}

impl<P> Default for HandlerRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> HandlerRegistry<P> {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Hands the request back if `id` is already taken; the existing entry
    /// is kept.
    pub fn register(&self, id: QueryId, request: PendingRequest<P>) -> Result<(), PendingRequest<P>> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(request),
            Entry::Vacant(slot) => {
                slot.insert(request);
                Ok(())
            }
        }
    }

    pub fn take_and_remove(&self, id: QueryId) -> Option<PendingRequest<P>> {
        self.pending.remove(&id).map(|(_, request)| request)
    }

    /// Remove every pending request, lowest id first.
    pub fn drain_all(&self) -> Vec<(QueryId, PendingRequest<P>)> {
        let mut ids: Vec<QueryId> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Run a handler, turning a panic into an error.
pub(crate) fn guarded<F>(f: F) -> HandlerResult
where
    F: FnOnce() -> HandlerResult,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(
            "handler panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

/// Hand a handler failure to the first exception handler available. Panics
/// from the exception handler itself are swallowed.
pub(crate) fn route_failure(
    error: anyhow::Error,
    primary: Option<&ExceptionHandler>,
    fallback: Option<&ExceptionHandler>,
) {
    match primary.or(fallback) {
        Some(handler) => {
            let handler = handler.clone();
            if panic::catch_unwind(AssertUnwindSafe(move || handler(error))).is_err() {
                debug!("Exception handler panicked; ignoring");
            }
        }
        None => warn!("Unhandled error raised by an event handler: {:#}", error),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> PendingRequest<String> {
        PendingRequest::new(Box::new(|_| Ok(())), None)
    }

    #[test]
    fn register_and_take_once() {
        let registry = HandlerRegistry::new();
        assert!(registry.register(QueryId(1), noop()).is_ok());
        assert_eq!(registry.len(), 1);

        assert!(registry.take_and_remove(QueryId(1)).is_some());
        assert!(registry.take_and_remove(QueryId(1)).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = HandlerRegistry::new();
        assert!(registry.register(QueryId(5), noop()).is_ok());
        assert!(registry.register(QueryId(5), noop()).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn drain_all_empties_in_id_order() {
        let registry = HandlerRegistry::new();
        for id in [9, 3, 7, 1] {
            assert!(registry.register(QueryId(id), noop()).is_ok());
        }

        let drained: Vec<u64> = registry.drain_all().into_iter().map(|(id, _)| id.0).collect();
        assert_eq!(drained, vec![1, 3, 7, 9]);
        assert_eq!(registry.len(), 0);
        assert!(registry.drain_all().is_empty());
    }

    #[test]
    fn guarded_converts_panics() {
        let result = guarded(|| panic!("kaboom"));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("kaboom"));

        assert!(guarded(|| Ok(())).is_ok());
        assert!(guarded(|| Err(anyhow::anyhow!("nope"))).is_err());
    }

    #[test]
    fn route_failure_prefers_primary() {
        let primary_hits = Arc::new(AtomicUsize::new(0));
        let fallback_hits = Arc::new(AtomicUsize::new(0));

        let primary: ExceptionHandler = {
            let hits = primary_hits.clone();
            Arc::new(move |_: anyhow::Error| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let fallback: ExceptionHandler = {
            let hits = fallback_hits.clone();
            Arc::new(move |_: anyhow::Error| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        route_failure(anyhow::anyhow!("a"), Some(&primary), Some(&fallback));
        route_failure(anyhow::anyhow!("b"), None, Some(&fallback));
        route_failure(anyhow::anyhow!("c"), None, None);

        assert_eq!(primary_hits.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_exception_handler_is_swallowed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: ExceptionHandler = {
            let seen = seen.clone();
            Arc::new(move |err: anyhow::Error| {
                seen.lock().unwrap().push(err.to_string());
                panic!("exception handler failed too");
            })
        };

        route_failure(anyhow::anyhow!("original"), Some(&handler), None);
        assert_eq!(seen.lock().unwrap().as_slice(), ["original"]);
    }
}
