//! Client dispatch - routes a native client library's event stream to handlers
//!
//! A native library serves many logical clients and reports everything it
//! produces as batches of `(query id, event)` pairs tagged with a client id.
//! This crate turns that stream into per-request callbacks: a
//! [`ClientManager`] owns the transport and fans batches out to the
//! [`ClientDispatcher`] registered for each client, which matches responses
//! to the handler registered when the request was sent and routes
//! unsolicited updates (query id 0) to its update handler.
//!
//! # Example
//!
//! ```no_run
//! use client_dispatch::loopback::{LoopbackQuery, LoopbackTransport};
//! use client_dispatch::{ClientManager, DispatchConfig, Event};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = ClientManager::start(LoopbackTransport::new(), DispatchConfig::default())
//!         .unwrap();
//!
//!     let client = manager.new_client();
//!     client
//!         .initialize_updates_mode(
//!             |updates| {
//!                 println!("{} update(s)", updates.len());
//!                 Ok(())
//!             },
//!             None,
//!             None,
//!         )
//!         .unwrap();
//!
//!     match client.request(LoopbackQuery::Echo("hi".into())).await.unwrap() {
//!         Event::Object(text) => println!("echoed {}", text),
//!         other => println!("unexpected {:?}", other),
//!     }
//!
//!     client.send(LoopbackQuery::Close, |_| Ok(()), None).unwrap();
//!     manager.shutdown();
//! }
//! ```

pub mod config;
mod dispatcher;
mod error;
mod event;
mod handler;
mod ids;
pub mod loopback;
mod manager;
mod receiver;
mod stats;
pub mod transport;

pub use config::{DispatchConfig, ReceiverConfig, load_config, resolve_config};
pub use dispatcher::ClientDispatcher;
pub use error::{DispatchError, TransportError};
pub use event::{
    CLOSED_ERROR_CODE, CLOSED_ERROR_MESSAGE, ErrorEvent, Event, EventBatch,
    REQUEST_ABORTED_MESSAGE,
};
pub use handler::{ExceptionHandler, HandlerResult};
pub use ids::{ClientId, QueryId, QueryIdAllocator};
pub use manager::{ClientManager, ManagerCell};
pub use stats::{DispatchStats, StatsSnapshot};
pub use transport::{Request, Transport};
