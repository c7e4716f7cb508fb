//! Event and session substrate for the Thornwood text-world server.
//!
//! Everything a transport needs to turn a parsed command into a durable,
//! ordered, observable event: the append-only store with replay and a
//! LISTEN/NOTIFY push channel, the in-process broadcaster, per-character
//! sessions with reconnect cursors, the command engine, and the schema
//! migrator. Transports (telnet, websocket, control socket), command
//! parsing, and the plugin host live in sibling crates and consume this one.

pub mod broadcast;
pub mod db;
pub mod engine;
pub mod event;
pub mod migrate;
pub mod session;
pub mod store;

pub use broadcast::{Broadcaster, Subscription};
pub use engine::Engine;
pub use event::{Actor, ActorKind, Event, EventId, EventType};
pub use session::{Session, SessionManager};
pub use store::EventStore;
