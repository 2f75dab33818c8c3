//! Kiln Daemon - Remote Artifact Cache Server
//!
//! Features:
//! - Fixed-header GET/PUT/LST/BYE protocol shared with the `NetCache` client
//! - One task per connection on the tokio runtime
//! - Entries written to a temporary file and renamed into place
//! - LRU eviction once the stored bytes reach the budget

pub mod server;
pub mod state;

pub use server::CacheServer;
pub use state::{CacheIndex, ServerConfig};
