//! # Parley Client Library
//!
//! Client core for multi-device end-to-end encrypted messaging.
//!
//! ## Overview
//!
//! - **Sessions**: one ratchet session per remote device, bootstrapped from
//!   prekey bundles and persisted in a [`store::SignalStore`]
//! - **Fan-out**: one logical message becomes one envelope per device, or a
//!   single sender-key broadcast for larger groups
//! - **Queries**: request/response correlation over one multiplexed
//!   connection, with timeouts and teardown
//! - **Inbound**: decryption of received `message` stanzas
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Connection                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │    Query     │  │   Envelope   │  │     Message      │   │
//! │  │  Correlator  │  │   Builder    │  │    Decryptor     │   │
//! │  └──────────────┘  └──────┬───────┘  └────────┬─────────┘   │
//! │                           └─────────┬─────────┘             │
//! │                          ┌──────────▼─────────┐             │
//! │                          │ Session Repository │             │
//! │                          └──────────┬─────────┘             │
//! │                          ┌──────────▼─────────┐             │
//! │                          │    Signal Store    │             │
//! │                          └────────────────────┘             │
//! │  Transport: WebSocket | in-memory                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use parley::connection::{Connection, ConnectionOptions};
//! use parley::signal::{LocalIdentity, NoBundles, SessionRepository};
//! use parley::store::FileStore;
//! use parley::Config;
//! use protocol::{BinaryNode, DeviceAddress};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let store = Arc::new(FileStore::open(&config.session.store_path)?);
//!     let local = LocalIdentity::provision(store.as_ref(), 1234, 0, 100)?;
//!     let repository = Arc::new(SessionRepository::new(
//!         DeviceAddress::new("15551234567", 0),
//!         local,
//!         store,
//!         Arc::new(NoBundles),
//!         config.session.repository_config(),
//!     ));
//!
//!     let (sender, receiver) = parley::transport::websocket::connect(
//!         &config.connection.url,
//!         config.connection.connect_timeout(),
//!     )
//!     .await?;
//!     let (connection, _inbound) = Connection::open(
//!         ConnectionOptions::from_config(&config),
//!         Box::new(sender),
//!         Box::new(receiver),
//!         repository,
//!     );
//!
//!     let response = connection.query(BinaryNode::new("iq").with_attr("type", "get")).await?;
//!     println!("{:?}", response);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`connection`]: Connection context, reader loop and keepalive
//! - [`error`]: Error types
//! - [`fanout`]: Per-device envelope building
//! - [`inbound`]: Decryption of received stanzas
//! - [`logging`]: Tracing subscriber setup
//! - [`query`]: Query correlation
//! - [`signal`]: Session repository
//! - [`store`]: Session persistence
//! - [`transport`]: WebSocket and in-memory transports

pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod inbound;
pub mod logging;
pub mod query;
pub mod signal;
pub mod store;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use connection::{Connection, ConnectionEvent, ConnectionOptions, InboundEvent, RelayReport};
pub use error::{
    DisconnectReason, Error, QueryError, Result, SessionError, StoreError, TransportError,
};
pub use fanout::{
    EnvelopeBuilder, Fanout, FanoutConfig, LogicalMessage, RelayOptions, SenderKeyDelivery,
};
pub use inbound::{DecryptedMessage, MessageDecryptor};
pub use query::{QueryCorrelator, TagGenerator};
pub use signal::{LocalIdentity, RepositoryConfig, SessionRepository};
pub use store::{FileStore, SignalStore};
