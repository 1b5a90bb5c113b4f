use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::{error, info, trace, warn};

use crate::config::DispatchConfig;
use crate::dispatcher::ClientDispatcher;
use crate::error::DispatchError;
use crate::event::{Event, EventBatch};
use crate::ids::{ClientId, QueryId, QueryIdAllocator};
use crate::receiver::ResponseReceiver;
use crate::stats::DispatchStats;
use crate::transport::Transport;

/// Directory of live clients and the fan-out point for the native event
/// stream.
///
/// Constructed explicitly with [`ClientManager::start`] and passed to every
/// [`ClientDispatcher`]. Use a [`ManagerCell`] when one shared instance per
/// process is wanted.
pub struct ClientManager<T: Transport> {
    transport: Arc<T>,
    config: DispatchConfig,
    clients: DashMap<ClientId, Arc<ClientDispatcher<T>>>,
    query_ids: QueryIdAllocator,
    stats: DispatchStats,
    receiver: Mutex<Option<ResponseReceiver>>,
    shut_down: AtomicBool,
}

impl<T: Transport> ClientManager<T> {
    /// Start the transport and, unless configured with zero threads, the
    /// receiver threads feeding [`handle_client_events`](Self::handle_client_events).
    pub fn start(transport: T, config: DispatchConfig) -> Result<Arc<Self>, DispatchError> {
        config.validate()?;
        transport.start()?;

        let manager = Arc::new(Self {
            transport: Arc::new(transport),
            config,
            clients: DashMap::new(),
            query_ids: QueryIdAllocator::new(),
            stats: DispatchStats::new(),
            receiver: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let mut threads = 0;
        if manager.config.receiver.threads > 0 {
            let weak = Arc::downgrade(&manager);
            let receiver = ResponseReceiver::spawn(
                manager.transport.clone(),
                &manager.config.receiver,
                move |batch| match weak.upgrade() {
                    Some(manager) => {
                        manager.handle_client_events(batch);
                        true
                    }
                    None => false,
                },
            )?;
            threads = receiver.thread_count();
            *manager.receiver.lock() = Some(receiver);
        }

        info!(
            "Client manager '{}' started with {} receiver thread(s)",
            manager.config.implementation_name, threads
        );
        Ok(manager)
    }

    /// Create a new, not yet initialized client bound to this manager.
    pub fn new_client(self: &Arc<Self>) -> Arc<ClientDispatcher<T>> {
        ClientDispatcher::new(self.clone())
    }

    pub fn implementation_name(&self) -> &str {
        &self.config.implementation_name
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Query ids come from one allocator shared by every client, so they are
    /// unique across the whole manager.
    pub fn next_query_id(&self) -> QueryId {
        self.query_ids.next()
    }

    pub fn register_client(
        &self,
        client_id: ClientId,
        dispatcher: Arc<ClientDispatcher<T>>,
    ) -> Result<(), DispatchError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DispatchError::ManagerShutDown);
        }

        match self.clients.entry(client_id) {
            Entry::Occupied(_) => return Err(DispatchError::ClientAlreadyRegistered(client_id)),
            Entry::Vacant(slot) => {
                slot.insert(dispatcher);
            }
        }
        self.stats.client_registered();

        if let Some(receiver) = self.receiver.lock().as_ref() {
            receiver.register_client(client_id);
        }
        Ok(())
    }

    pub fn is_registered(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    /// Ids of clients currently registered, in ascending order.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.clients.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Clients the receiver still expects events for.
    pub fn live_clients(&self) -> Vec<ClientId> {
        self.receiver
            .lock()
            .as_ref()
            .map(|receiver| receiver.live_clients())
            .unwrap_or_else(|| self.client_ids())
    }

    /// Route one batch to the client it belongs to. Never fails: events for
    /// unknown clients are logged and counted.
    pub fn handle_client_events(&self, batch: EventBatch<T::Payload>) {
        self.stats.batch_received();
        let EventBatch {
            client_id,
            is_closed,
            events,
        } = batch;

        // Clone out of the map so no shard lock is held while handlers run.
        let dispatcher = self.clients.get(&client_id).map(|entry| entry.value().clone());
        match dispatcher {
            Some(dispatcher) => dispatcher.handle_events(is_closed, events),
            None => self.report_unknown_client(client_id, events),
        }

        if is_closed {
            trace!("Removing client {} from event handlers", client_id);
            if self.clients.remove(&client_id).is_some() {
                self.stats.client_closed();
            }
            trace!("Removed client {} from event handlers", client_id);
        }
    }

    fn report_unknown_client(&self, client_id: ClientId, events: Vec<(QueryId, Event<T::Payload>)>) {
        let (aborted, dropped): (Vec<_>, Vec<_>) = events
            .into_iter()
            .partition(|(_, event)| event.is_request_aborted());

        // Aborted requests of a client we already closed were resolved at
        // closure time.
        self.stats.aborts_suppressed(aborted.len());
        if dropped.is_empty() {
            return;
        }

        self.stats.events_dropped(dropped.len());
        let total = dropped.len();
        for (id, event) in dropped {
            error!(
                "Unknown client id \"{}\"! The following event ({} dropped in this batch), with id \"{}\", has been dropped: {:?}",
                client_id, total, id, event
            );
        }
    }

    /// Receive once on the calling thread and fan out whatever arrived.
    /// Returns the number of batches handled.
    pub fn poll_once(&self, timeout: Duration) -> Result<usize, DispatchError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DispatchError::ManagerShutDown);
        }
        let batches = self.transport.receive(timeout)?;
        let count = batches.len();
        for batch in batches {
            self.handle_client_events(batch);
        }
        Ok(count)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the receiver threads and forget every client. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // Take it out first: a receiver thread may be waiting on this lock.
        let receiver = self.receiver.lock().take();
        if let Some(receiver) = receiver {
            receiver.close();
        }

        let open = self.clients.len();
        if open > 0 {
            warn!("Shutting down with {} client(s) still open", open);
        }
        self.clients.clear();
        info!("Client manager '{}' shut down", self.config.implementation_name);
    }
}

/// Lazily-started, process-wide [`ClientManager`].
///
/// Concurrent first callers all get the same instance and the start-up
/// closure runs once. A failed start leaves the cell empty so a later call
/// can retry.
pub struct ManagerCell<T: Transport> {
    slot: Mutex<Option<Arc<ClientManager<T>>>>,
}

impl<T: Transport> Default for ManagerCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> ManagerCell<T> {
    pub const fn new() -> Self {
        Self {
            slot: parking_lot::const_mutex(None),
        }
    }

    pub fn get_or_start<F>(&self, start: F) -> Result<Arc<ClientManager<T>>, DispatchError>
    where
        F: FnOnce() -> Result<(T, DispatchConfig), DispatchError>,
    {
        let mut slot = self.slot.lock();
        if let Some(manager) = slot.as_ref() {
            return Ok(manager.clone());
        }
        let (transport, config) = start()?;
        let manager = ClientManager::start(transport, config)?;
        *slot = Some(manager.clone());
        Ok(manager)
    }

    pub fn get(&self) -> Option<Arc<ClientManager<T>>> {
        self.slot.lock().clone()
    }

    /// Shut the manager down and empty the cell.
    pub fn shutdown(&self) {
        let manager = self.slot.lock().take();
        if let Some(manager) = manager {
            manager.shutdown();
        }
    }
}
