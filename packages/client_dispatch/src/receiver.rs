//! Threads pumping the native event stream into the client manager.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ReceiverConfig;
use crate::error::{DispatchError, TransportError};
use crate::event::EventBatch;
use crate::ids::ClientId;
use crate::transport::Transport;

/// Dedicated blocking threads that poll [`Transport::receive`] and hand each
/// batch to a sink on the same thread.
///
/// The sink returns `false` once nobody is listening any more, which ends
/// the thread. Handlers run inline, so a slow handler delays every batch
/// behind it on that thread.
pub(crate) struct ResponseReceiver {
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    live_clients: Arc<Mutex<BTreeSet<ClientId>>>,
}

impl ResponseReceiver {
    pub fn spawn<T, F>(
        transport: Arc<T>,
        config: &ReceiverConfig,
        sink: F,
    ) -> Result<Self, DispatchError>
    where
        T: Transport,
        F: Fn(EventBatch<T::Payload>) -> bool + Send + Sync + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let live_clients = Arc::new(Mutex::new(BTreeSet::new()));
        let sink = Arc::new(sink);
        let mut threads = Vec::with_capacity(config.threads);

        for index in 0..config.threads {
            let transport = transport.clone();
            let thread_stop = stop.clone();
            let thread_clients = live_clients.clone();
            let sink = sink.clone();
            let poll_timeout = config.poll_timeout();
            let backoff = config.error_backoff();

            let spawned = std::thread::Builder::new()
                .name(format!("dispatch-receiver-{}", index))
                .spawn(move || {
                    debug!("Receiver thread {} started", index);
                    while !thread_stop.load(Ordering::Acquire) {
                        match transport.receive(poll_timeout) {
                            Ok(batches) => {
                                for batch in batches {
                                    let closing = batch.is_closed.then_some(batch.client_id);
                                    let keep_going = sink(batch);
                                    // only after the sink drained the client
                                    if let Some(client_id) = closing {
                                        thread_clients.lock().remove(&client_id);
                                    }
                                    if !keep_going {
                                        debug!("Client manager dropped; receiver {} exiting", index);
                                        return;
                                    }
                                }
                            }
                            Err(TransportError::Disconnected) => {
                                info!("Transport disconnected; receiver {} exiting", index);
                                break;
                            }
                            Err(e) => {
                                warn!("Receiving events failed: {}", e);
                                std::thread::sleep(backoff);
                            }
                        }
                    }
                    debug!("Receiver thread {} exiting", index);
                });

            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    error!("Failed to spawn receiver thread {}: {}", index, e);
                    stop_and_join(&stop, threads);
                    return Err(DispatchError::Spawn(e.to_string()));
                }
            }
        }

        Ok(Self {
            stop,
            threads: Mutex::new(threads),
            live_clients,
        })
    }

    pub fn register_client(&self, client_id: ClientId) {
        self.live_clients.lock().insert(client_id);
    }

    pub fn live_clients(&self) -> Vec<ClientId> {
        self.live_clients.lock().iter().copied().collect()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Signal every thread to stop and wait for them. Safe to call from a
    /// receiver thread: that thread is not joined.
    pub fn close(&self) {
        let handles = std::mem::take(&mut *self.threads.lock());
        stop_and_join(&self.stop, handles);

        let remaining = self.live_clients.lock().len();
        if remaining > 0 {
            debug!("Receiver closed with {} live client(s)", remaining);
        }
    }
}

/// Raise `stop` and join every handle except the calling thread's own.
fn stop_and_join(stop: &AtomicBool, handles: Vec<JoinHandle<()>>) {
    stop.store(true, Ordering::Release);
    let current = std::thread::current().id();
    for handle in handles {
        if handle.thread().id() == current {
            continue;
        }
        if handle.join().is_err() {
            warn!("Receiver thread panicked");
        }
    }
}

impl Drop for ResponseReceiver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
