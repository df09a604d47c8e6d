//! Hive Messenger: ordered, at-least-once messaging over a lossy channel.
//!
//! Instances sharing a broadcast "post a message" primitive (browser frames,
//! workers, extension panels, an in-process bus) find each other, exchange
//! typed events and keep per-peer ordering even when the channel drops
//! messages.
//!
//! # Architecture
//!
//! - **Transport**: any [`Transport`] impl; [`MemoryChannel`] ships in-crate.
//! - **Envelope**: JSON metadata stamped onto every message, filtered by
//!   [`Classifier`](classify::Classifier).
//! - **Connections**: per-peer sent/received counters with a `desync` flag.
//! - **Discovery**: periodic beacons; a new peer gets the whole Outbound Log.
//! - **Recovery**: a gap triggers a `lost-events-request`, answered by one
//!   `event-batch`.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hive_messenger::{MemoryChannel, Messenger, MessengerConfig};
//!
//! # async fn example() -> Result<(), hive_messenger::MessengerError> {
//! let channel = MemoryChannel::new();
//! let panel = Messenger::builder(MessengerConfig::new("panel"), Arc::new(channel.clone()))
//!     .on_event(|event| println!("{}: {}", event.kind.as_str(), event.payload))
//!     .start()?;
//!
//! panel.broadcast("ready", serde_json::json!({}))?;
//! channel.flush();
//! panel.destroy();
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod logging;
pub mod message;
pub mod messenger;
pub mod recovery;
pub mod registry;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use classify::RawMessage;
pub use config::MessengerConfig;
pub use connection::Connection;
pub use error::MessengerError;
pub use identity::PeerId;
pub use message::{Envelope, MessageKind, OutboundEvent};
pub use messenger::{Messenger, MessengerBuilder};
pub use registry::Registry;
pub use transport::{MemoryChannel, Transport};
