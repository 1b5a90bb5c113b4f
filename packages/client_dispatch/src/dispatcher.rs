use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::error::DispatchError;
use crate::event::Event;
use crate::handler::{
    DispatchMode, ExceptionHandler, HandlerRegistry, HandlerResult, PendingRequest, guarded,
    route_failure,
};
use crate::ids::{ClientId, QueryId};
use crate::manager::ClientManager;
use crate::transport::{Request, Transport};

type Payload<T> = <T as Transport>::Payload;

/// Handlers fixed at initialization.
struct Settings<P> {
    mode: DispatchMode<P>,
    default_exception_handler: Option<ExceptionHandler>,
}

/// One logical client: owns its handler table and decides where every
/// event for its client id goes.
///
/// Lifecycle: created unregistered, becomes live once an `initialize_*`
/// call registers it with the [`ClientManager`], and turns closed for good
/// when the native side reports closure.
pub struct ClientDispatcher<T: Transport> {
    manager: Arc<ClientManager<T>>,
    registry: HandlerRegistry<Payload<T>>,
    settings: OnceLock<Settings<Payload<T>>>,
    client_id: OnceLock<ClientId>,
    init_failed: AtomicBool,
    closed: AtomicBool,
}

impl<T: Transport> ClientDispatcher<T> {
    pub fn new(manager: Arc<ClientManager<T>>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            registry: HandlerRegistry::new(),
            settings: OnceLock::new(),
            client_id: OnceLock::new(),
            init_failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn client_id(&self) -> Result<ClientId, DispatchError> {
        self.client_id
            .get()
            .copied()
            .ok_or(DispatchError::NotInitialized)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    /// Initialize with a batched updates handler: every batch's updates
    /// (events with id 0) arrive in one call, in arrival order.
    pub fn initialize_updates_mode<F>(
        self: &Arc<Self>,
        updates_handler: F,
        update_exception_handler: Option<ExceptionHandler>,
        default_exception_handler: Option<ExceptionHandler>,
    ) -> Result<ClientId, DispatchError>
    where
        F: Fn(Vec<Event<Payload<T>>>) -> HandlerResult + Send + Sync + 'static,
    {
        self.initialize(
            DispatchMode::Updates {
                handler: Arc::new(updates_handler),
                exception_handler: update_exception_handler,
            },
            default_exception_handler,
        )
    }

    /// Initialize with one default handler that receives each update
    /// individually.
    pub fn initialize_single_handler_mode<F>(
        self: &Arc<Self>,
        result_handler: F,
        update_exception_handler: Option<ExceptionHandler>,
        default_exception_handler: Option<ExceptionHandler>,
    ) -> Result<ClientId, DispatchError>
    where
        F: Fn(Event<Payload<T>>) -> HandlerResult + Send + Sync + 'static,
    {
        self.initialize(
            DispatchMode::SingleHandler {
                handler: Arc::new(result_handler),
                exception_handler: update_exception_handler,
            },
            default_exception_handler,
        )
    }

    fn initialize(
        self: &Arc<Self>,
        mode: DispatchMode<Payload<T>>,
        default_exception_handler: Option<ExceptionHandler>,
    ) -> Result<ClientId, DispatchError> {
        let mode_name = mode.name();
        let settings = Settings {
            mode,
            default_exception_handler,
        };
        if self.settings.set(settings).is_err() {
            return Err(DispatchError::AlreadyInitialized);
        }

        let client_id = match self.manager.transport().create() {
            Ok(id) => id,
            Err(e) => {
                self.init_failed.store(true, Ordering::Release);
                error!("Failed to create native client: {}", e);
                return Err(e.into());
            }
        };

        if let Err(e) = self.manager.register_client(client_id, self.clone()) {
            self.init_failed.store(true, Ordering::Release);
            return Err(e);
        }
        let _ = self.client_id.set(client_id);
        info!("Registered new client {} ({} mode)", client_id, mode_name);

        // The first real request can get lost if it reaches the native client
        // before it finished starting up; a throwaway query absorbs that.
        if self.manager.config().warm_up {
            if let Err(e) = self.send(<T::Query as Request>::warm_up(), |_| Ok(()), None) {
                warn!("Warm-up request for client {} failed: {}", client_id, e);
            }
        }

        Ok(client_id)
    }

    fn ready_client_id(&self) -> Result<ClientId, DispatchError> {
        if self.init_failed.load(Ordering::Acquire) {
            return Err(DispatchError::InitializationFailed);
        }
        self.client_id()
    }

    /// Send a request; `result_handler` is called exactly once with the
    /// response, on the receiver thread.
    ///
    /// On a closed client the handler gets a synthetic [`Event::Ok`] right
    /// away instead. Close requests are still forwarded in that case.
    pub fn send<F>(
        &self,
        query: T::Query,
        result_handler: F,
        exception_handler: Option<ExceptionHandler>,
    ) -> Result<(), DispatchError>
    where
        F: FnOnce(Event<Payload<T>>) -> HandlerResult + Send + Sync + 'static,
    {
        trace!("Trying to send {:?}", query);
        let client_id = self.ready_client_id()?;
        let pending = PendingRequest::new(Box::new(result_handler), exception_handler);

        if self.is_closed() {
            self.deliver(pending, Event::Ok);
            if query.is_close() {
                let query_id = self.manager.next_query_id();
                if let Err(e) = self.manager.transport().send(client_id, query_id, query) {
                    warn!("Forwarding close for closed client {} failed: {}", client_id, e);
                }
            }
            return Ok(());
        }

        let query_id = self.register_pending(pending);

        // Closure may have drained the registry between the check above and
        // the registration; whoever removes the entry first delivers it.
        if self.is_closed() {
            if let Some(pending) = self.registry.take_and_remove(query_id) {
                self.manager.stats().request_force_closed();
                self.deliver(pending, Event::closed());
            }
            return Ok(());
        }

        if let Err(e) = self.manager.transport().send(client_id, query_id, query) {
            self.registry.take_and_remove(query_id);
            return Err(e.into());
        }
        Ok(())
    }

    fn register_pending(&self, mut pending: PendingRequest<Payload<T>>) -> QueryId {
        loop {
            let query_id = self.manager.next_query_id();
            match self.registry.register(query_id, pending) {
                Ok(()) => return query_id,
                Err(returned) => {
                    // only possible after the counter wrapped around
                    debug!("Query id {} still pending, allocating another", query_id);
                    pending = returned;
                }
            }
        }
    }

    /// Send a request and wait for its response asynchronously.
    pub fn request(
        &self,
        query: T::Query,
    ) -> impl Future<Output = Result<Event<Payload<T>>, DispatchError>> + Send + use<T> {
        let (respond_to, response) = oneshot::channel();
        let sent = self.send(
            query,
            move |event| {
                let _ = respond_to.send(event);
                Ok(())
            },
            None,
        );
        async move {
            sent?;
            response.await.map_err(|_| DispatchError::ResponseDropped)
        }
    }

    /// Run a query synchronously on the native side. No handler bookkeeping.
    pub fn execute(&self, query: T::Query) -> Event<Payload<T>> {
        trace!("Trying to execute {:?}", query);
        if self.is_closed() && !query.is_close() {
            return Event::Ok;
        }
        self.manager.transport().execute(query)
    }

    /// Dispatch one batch for this client. Runs on the thread that received
    /// the batch; handler failures never escape.
    pub fn handle_events(&self, is_closed: bool, events: Vec<(QueryId, Event<Payload<T>>)>) {
        match self.settings.get() {
            Some(settings) => self.dispatch(settings, events),
            None => {
                error!(
                    "Client received {} events before initialization; dropping them",
                    events.len()
                );
                self.manager.stats().events_dropped(events.len());
            }
        }

        if is_closed
            && self
                .closed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.handle_close();
        }
    }

    fn dispatch(&self, settings: &Settings<Payload<T>>, events: Vec<(QueryId, Event<Payload<T>>)>) {
        let default_exception_handler = settings.default_exception_handler.as_ref();
        match &settings.mode {
            DispatchMode::Updates {
                handler,
                exception_handler,
            } => {
                let mut updates = Vec::new();
                for (id, event) in events {
                    if id.is_unsolicited() {
                        updates.push(event);
                    } else {
                        self.handle_response(id, event);
                    }
                }
                // one call per batch, even when it carried no updates
                let count = updates.len();
                match guarded(|| handler(updates)) {
                    Ok(()) => self.manager.stats().updates_delivered(count),
                    Err(err) => {
                        self.manager.stats().handler_failed();
                        route_failure(err, exception_handler.as_ref(), default_exception_handler);
                    }
                }
            }
            DispatchMode::SingleHandler {
                handler,
                exception_handler,
            } => {
                for (id, event) in events {
                    trace!("Received response {}: {:?}", id, event);
                    if !id.is_unsolicited() {
                        self.handle_response(id, event);
                        continue;
                    }
                    match guarded(|| handler(event)) {
                        Ok(()) => self.manager.stats().updates_delivered(1),
                        Err(err) => {
                            self.manager.stats().handler_failed();
                            route_failure(err, exception_handler.as_ref(), default_exception_handler);
                        }
                    }
                }
            }
        }
    }

    fn handle_response(&self, id: QueryId, event: Event<Payload<T>>) {
        match self.registry.take_and_remove(id) {
            Some(pending) => {
                self.manager.stats().response_delivered();
                self.deliver(pending, event);
            }
            None => {
                error!(
                    "Unknown event id \"{}\", the event has been dropped! {:?}",
                    id, event
                );
                self.manager.stats().events_dropped(1);
            }
        }
    }

    fn deliver(&self, pending: PendingRequest<Payload<T>>, event: Event<Payload<T>>) {
        let PendingRequest {
            result_handler,
            exception_handler,
        } = pending;
        if let Err(err) = guarded(|| result_handler(event)) {
            self.manager.stats().handler_failed();
            let default_exception_handler = self
                .settings
                .get()
                .and_then(|s| s.default_exception_handler.as_ref());
            route_failure(err, exception_handler.as_ref(), default_exception_handler);
        }
    }

    fn handle_close(&self) {
        trace!("Received close");
        for (_, pending) in self.registry.drain_all() {
            self.manager.stats().request_force_closed();
            self.deliver(pending, Event::closed());
        }
        match self.client_id.get() {
            Some(id) => info!("Client closed {}", id),
            None => info!("Client closed before registration finished"),
        }
    }
}
