// Realtime conversation client: message cache, live channels, presence and
// optimistic sends on top of a hosted backend reached through ports.

pub mod backoff;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod memory;
pub mod models;
pub mod outbound;
pub mod ports;
pub mod presence;
pub mod store;
pub mod subscription;
pub mod utils;
pub mod wire;

// Re-export main types for convenience
pub use client::{ChatClient, ChatClientBuilder};
pub use config::SyncConfig;
pub use error::{ChatError, Result};
pub use models::*;
pub use store::{AppendOutcome, ConversationStore, StoreChange};
pub use subscription::SubscriptionHandle;
