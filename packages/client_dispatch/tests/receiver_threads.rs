use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use client_dispatch::loopback::{LoopbackQuery, LoopbackTransport};
use client_dispatch::{
    CLOSED_ERROR_CODE, ClientId, ClientManager, DispatchConfig, Event, EventBatch, ManagerCell,
    QueryId, ReceiverConfig,
};

fn threaded_config(warm_up: bool) -> DispatchConfig {
    DispatchConfig {
        warm_up,
        receiver: ReceiverConfig {
            threads: 1,
            poll_timeout_ms: 10,
            error_backoff_ms: 1,
        },
        ..DispatchConfig::default()
    }
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

#[tokio::test]
async fn request_resolves_through_receiver_thread() {
    let manager = ClientManager::start(LoopbackTransport::new(), threaded_config(true)).unwrap();
    let client = manager.new_client();
    client
        .initialize_updates_mode(|_| Ok(()), None, None)
        .unwrap();

    let event = client
        .request(LoopbackQuery::Echo("ping".to_string()))
        .await
        .unwrap();
    assert_eq!(event, Event::Object("ping".to_string()));

    let failed = client
        .request(LoopbackQuery::Fail("nope".to_string()))
        .await
        .unwrap();
    assert_eq!(failed.as_error().unwrap().message, "nope");

    // warm-up plus the two requests above
    assert!(wait_until(Duration::from_secs(2), || {
        manager.stats().snapshot().responses_delivered == 3
    }));
    manager.shutdown();
}

#[test]
fn updates_are_batched_in_arrival_order() {
    let manager =
        ClientManager::start(LoopbackTransport::manual(), threaded_config(false)).unwrap();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let client = manager.new_client();
    let client_id = client
        .initialize_updates_mode(
            move |updates| {
                tx.lock().unwrap().send(updates).unwrap();
                Ok(())
            },
            None,
            None,
        )
        .unwrap();

    manager.transport().inject(EventBatch::new(
        client_id,
        vec![
            (QueryId::UNSOLICITED, Event::Object("a".to_string())),
            (QueryId::UNSOLICITED, Event::Object("b".to_string())),
        ],
    ));

    let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(
        received,
        vec![Event::Object("a".to_string()), Event::Object("b".to_string())]
    );
    manager.shutdown();
}

#[test]
fn close_removes_client_and_answers_pending_requests() {
    let manager =
        ClientManager::start(LoopbackTransport::manual(), threaded_config(false)).unwrap();
    let client = manager.new_client();
    let client_id = client
        .initialize_updates_mode(|_| Ok(()), None, None)
        .unwrap();

    const PENDING: usize = 16;
    let closed_errors = Arc::new(AtomicUsize::new(0));
    for _ in 0..PENDING {
        let closed_errors = closed_errors.clone();
        client
            .send(
                LoopbackQuery::GetState,
                move |event| {
                    if event.as_error().map(|e| e.code) == Some(CLOSED_ERROR_CODE) {
                        closed_errors.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                },
                None,
            )
            .unwrap();
    }
    assert_eq!(client.pending_requests(), PENDING);

    manager.transport().inject(EventBatch::closing(client_id, vec![]));

    assert!(wait_until(Duration::from_secs(2), || {
        closed_errors.load(Ordering::SeqCst) == PENDING
    }));
    assert!(wait_until(Duration::from_secs(2), || !manager.is_registered(client_id)));
    assert!(client.is_closed());
    assert_eq!(client.pending_requests(), 0);
    assert!(manager.live_clients().is_empty());

    let snapshot = manager.stats().snapshot();
    assert_eq!(snapshot.requests_force_closed, PENDING as u64);
    assert_eq!(snapshot.clients_open(), 0);
    manager.shutdown();
}

#[test]
fn sends_racing_close_are_answered_exactly_once() {
    let manager =
        ClientManager::start(LoopbackTransport::manual(), threaded_config(false)).unwrap();
    let client = manager.new_client();
    let client_id = client
        .initialize_updates_mode(|_| Ok(()), None, None)
        .unwrap();

    const SENDERS: usize = 4;
    const PER_SENDER: usize = 200;
    let answered = Arc::new(AtomicUsize::new(0));

    let senders: Vec<_> = (0..SENDERS)
        .map(|_| {
            let client = client.clone();
            let answered = answered.clone();
            std::thread::spawn(move || {
                for _ in 0..PER_SENDER {
                    let answered = answered.clone();
                    client
                        .send(
                            LoopbackQuery::GetState,
                            move |_| {
                                answered.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            },
                            None,
                        )
                        .unwrap();
                }
            })
        })
        .collect();

    manager.transport().inject(EventBatch::closing(client_id, vec![]));
    for sender in senders {
        sender.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || {
        answered.load(Ordering::SeqCst) == SENDERS * PER_SENDER
    }));
    // nothing is left to be answered twice
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(answered.load(Ordering::SeqCst), SENDERS * PER_SENDER);
    assert_eq!(client.pending_requests(), 0);
    manager.shutdown();
}

#[test]
fn leftover_aborts_after_close_are_not_reported_as_drops() {
    let manager = ClientManager::start(LoopbackTransport::new(), threaded_config(false)).unwrap();
    let client = manager.new_client();
    let client_id = client
        .initialize_updates_mode(|_| Ok(()), None, None)
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    client
        .send(
            LoopbackQuery::Close,
            move |event| {
                tx.lock().unwrap().send(event).unwrap();
                Ok(())
            },
            None,
        )
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Event::Ok);
    assert!(wait_until(Duration::from_secs(2), || !manager.is_registered(client_id)));

    // the native side still answers stray requests for the closed client
    manager.transport().inject(EventBatch::new(
        client_id,
        vec![(QueryId(999), Event::error(500, "Request aborted"))],
    ));
    assert!(wait_until(Duration::from_secs(2), || {
        manager.stats().snapshot().aborts_suppressed == 1
    }));
    assert_eq!(manager.stats().snapshot().events_dropped, 0);
    manager.shutdown();
}

#[test]
fn clients_share_one_manager_cell() {
    static CELL: ManagerCell<LoopbackTransport> = ManagerCell::new();

    let first = CELL
        .get_or_start(|| Ok((LoopbackTransport::new(), threaded_config(false))))
        .unwrap();
    let second = CELL
        .get_or_start(|| panic!("manager already started"))
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let a = first.new_client();
    let b = second.new_client();
    assert_eq!(a.initialize_updates_mode(|_| Ok(()), None, None).unwrap(), ClientId(1));
    assert_eq!(b.initialize_updates_mode(|_| Ok(()), None, None).unwrap(), ClientId(2));

    CELL.shutdown();
    assert!(CELL.get().is_none());
    assert!(first.is_shut_down());
}
