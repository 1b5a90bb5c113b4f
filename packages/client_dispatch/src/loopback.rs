//! In-memory [`Transport`] that answers requests itself.
//!
//! In auto-reply mode every request is answered with a response batch as
//! soon as it is sent; in manual mode requests are only recorded and the
//! caller injects batches. Either way batches are handed out in the order
//! they were queued. Meant for a single receiver thread: with more, batches
//! of one client may be processed concurrently.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::TransportError;
use crate::event::{Event, EventBatch, REQUEST_ABORTED_MESSAGE};
use crate::ids::{ClientId, QueryId};
use crate::transport::{Request, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackQuery {
    /// Answered with the client's state; used as the warm-up query
    GetState,
    /// Answered with the same text
    Echo(String),
    /// Answered with an error carrying this message
    Fail(String),
    /// Closes the client
    Close,
}

impl Request for LoopbackQuery {
    fn is_close(&self) -> bool {
        matches!(self, LoopbackQuery::Close)
    }

    fn warm_up() -> Self {
        LoopbackQuery::GetState
    }
}

/// A request as the transport saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentQuery {
    pub client_id: ClientId,
    pub query_id: QueryId,
    pub query: LoopbackQuery,
}

pub const STATE_READY: &str = "ready";
pub const FAIL_CODE: i32 = 400;

pub struct LoopbackTransport {
    auto_reply: bool,
    next_client: AtomicI32,
    queue: Mutex<VecDeque<EventBatch<String>>>,
    ready: Condvar,
    closed_clients: Mutex<BTreeSet<ClientId>>,
    sent: Mutex<Vec<SentQuery>>,
    executed: Mutex<Vec<LoopbackQuery>>,
    disconnected: AtomicBool,
    fail_next_create: AtomicBool,
    starts: AtomicUsize,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// Transport that answers every request.
    pub fn new() -> Self {
        Self::with_auto_reply(true)
    }

    /// Transport that only records requests.
    pub fn manual() -> Self {
        Self::with_auto_reply(false)
    }

    fn with_auto_reply(auto_reply: bool) -> Self {
        Self {
            auto_reply,
            next_client: AtomicI32::new(1),
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            closed_clients: Mutex::new(BTreeSet::new()),
            sent: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
            fail_next_create: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
        }
    }

    /// Queue a raw batch for the receiver.
    pub fn inject(&self, batch: EventBatch<String>) {
        self.queue.lock().push_back(batch);
        self.ready.notify_one();
    }

    /// Queue an unsolicited update for `client_id`.
    pub fn push_update(&self, client_id: ClientId, payload: String) {
        self.inject(EventBatch::new(
            client_id,
            vec![(QueryId::UNSOLICITED, Event::Object(payload))],
        ));
    }

    /// Make every later call fail with [`TransportError::Disconnected`] once
    /// the queue is empty.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
        self.ready.notify_all();
    }

    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::Release);
    }

    pub fn sent(&self) -> Vec<SentQuery> {
        self.sent.lock().clone()
    }

    pub fn executed(&self) -> Vec<LoopbackQuery> {
        self.executed.lock().clone()
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    fn answer(query: &LoopbackQuery) -> Event<String> {
        match query {
            LoopbackQuery::GetState => Event::Object(STATE_READY.to_string()),
            LoopbackQuery::Echo(text) => Event::Object(text.clone()),
            LoopbackQuery::Fail(message) => Event::error(FAIL_CODE, message.clone()),
            LoopbackQuery::Close => Event::Ok,
        }
    }

    fn reply(&self, client_id: ClientId, query_id: QueryId, query: &LoopbackQuery) {
        let mut closed = self.closed_clients.lock();
        let batch = if closed.contains(&client_id) {
            EventBatch::new(
                client_id,
                vec![(query_id, Event::error(500, REQUEST_ABORTED_MESSAGE))],
            )
        } else if query.is_close() {
            closed.insert(client_id);
            EventBatch::closing(client_id, vec![(query_id, Event::Ok)])
        } else {
            EventBatch::new(client_id, vec![(query_id, Self::answer(query))])
        };
        // queue while still holding the closed set so a close and a later
        // abort for the same client keep their order
        self.inject(batch);
    }
}

impl Transport for LoopbackTransport {
    type Query = LoopbackQuery;
    type Payload = String;

    fn start(&self) -> Result<(), TransportError> {
        self.starts.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn create(&self) -> Result<ClientId, TransportError> {
        if self.fail_next_create.swap(false, Ordering::AcqRel) {
            return Err(TransportError::Create("loopback refused".to_string()));
        }
        if self.disconnected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        Ok(ClientId(self.next_client.fetch_add(1, Ordering::AcqRel)))
    }

    fn send(
        &self,
        client_id: ClientId,
        query_id: QueryId,
        query: LoopbackQuery,
    ) -> Result<(), TransportError> {
        if self.disconnected.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        if self.auto_reply {
            self.reply(client_id, query_id, &query);
        }
        self.sent.lock().push(SentQuery {
            client_id,
            query_id,
            query,
        });
        Ok(())
    }

    fn execute(&self, query: LoopbackQuery) -> Event<String> {
        let event = Self::answer(&query);
        self.executed.lock().push(query);
        event
    }

    fn receive(&self, timeout: Duration) -> Result<Vec<EventBatch<String>>, TransportError> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            if self.disconnected.load(Ordering::Acquire) {
                return Err(TransportError::Disconnected);
            }
            let _ = self.ready.wait_for(&mut queue, timeout);
        }
        if queue.is_empty() && self.disconnected.load(Ordering::Acquire) {
            debug!("Loopback transport drained after disconnect");
            return Err(TransportError::Disconnected);
        }
        Ok(queue.drain(..).collect())
    }
}
