//! # assetsync
//!
//! Keeps AI-assistant assets (skills, commands, agents) consistent between a
//! central version authority and the machines that use them.
//!
//! Clients link assets to local files, then push edits, pull new server
//! versions, or leave a daemon running that does both. The server owns the
//! semantic version of every asset and records what each machine last saw.
//!
//! ```rust,no_run
//! use assetsync::links::{LinkRegistry, LinkSet};
//! use assetsync::sync::{ApiClient, NoHook, SyncEngine};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cwd = std::env::current_dir()?;
//!     let mut links = LinkSet::load(LinkRegistry::new(assetsync::config::home_dir()), &cwd);
//!     let client = ApiClient::new("http://localhost:3000", Some("token".into()), Duration::from_secs(30))?;
//!     let engine = SyncEngine::new(client, "machine-id");
//!
//!     let summary = engine.sync(&mut links, &NoHook).await?;
//!     println!("pushed {}, pulled {}", summary.pushed(), summary.pulled());
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod conflict;
pub mod error;
pub mod hash;
pub mod links;
pub mod logging;
pub mod poller;
pub mod server;
pub mod storage;
pub mod sync;
pub mod version;
pub mod watcher;

// Re-export main types for library consumers
pub use conflict::{decide, SyncAction};
pub use error::{Result, SyncError};
pub use hash::content_hash;
pub use links::{LinkEntry, LinkScope, LinkSet};
pub use storage::Database;
pub use sync::{ApiClient, SyncEngine, SyncRemote};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
