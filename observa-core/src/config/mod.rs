//! Block configuration
//!
//! Read from a TOML file, every section optional:
//!
//! ```toml
//! [block]
//! name = "C0"
//! port = 0
//! idle_timeout_ms = 10000
//!
//! [connection]
//! timeout_secs = 300
//! reconnect_secs = 60
//!
//! [centrald]
//! host = "localhost"
//! port = 617
//! login = "observer"
//! password = "secret"
//! ```

mod loader;
mod schema;

pub use loader::ConfigLoader;
pub use schema::*;
