//! observa-core: connection registry, command queues and event loop
//!
//! A process embeds one [`Block`], implements [`BlockHooks`] for whatever
//! it actually is, and drives it with [`Block::run`]:
//!
//! ```no_run
//! use observa_core::{Block, ConfigLoader, NoHooks};
//!
//! # async fn start() -> observa_utils::Result<()> {
//! let config = ConfigLoader::load_and_validate()?;
//! let mut block = Block::new(config, NoHooks);
//! block.run().await
//! # }
//! ```
//!
//! - [`event`]: events and the handler chain
//! - [`address`]: devices and clients announced by brokers
//! - [`command`]: queued requests and their completion rules
//! - [`connection`]: one peer session, its queue and mirrored values
//! - [`devclient`]: per-device-class reactions to peer updates
//! - [`block`]: the registry, line dispatch, state and timers
//! - [`net`]: the tokio socket driver
//! - [`config`]: TOML configuration

pub mod address;
pub mod block;
pub mod command;
pub mod config;
pub mod connection;
pub mod devclient;
pub mod event;
pub mod net;

pub use address::{ConnUser, NetworkAddress};
pub use block::{Block, BlockHooks, CommandReply, ConnCursor, NoHooks};
pub use command::Command;
pub use config::{BlockConfig, ConfigLoader};
pub use connection::{CentraldLogin, ConnId, ConnRole, ConnState, Connection};
pub use devclient::{DevClient, DevEffect, DeviceCallback};
pub use event::{Event, EventHandler, EventPayload, EventType, Handled, HandlerId, ObjectRef};
