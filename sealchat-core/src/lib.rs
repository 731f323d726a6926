//! SealChat core library
//!
//! End-to-end encrypted private chats: X3DH session setup, Double Ratchet
//! encryption, encrypted local storage and the authenticated request channel
//! to the chat backend. Hosts drive everything through [`ChatCore`].

pub mod backend;
pub mod chat;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod state;

pub use config::{CoreConfig, KeyStoreMode};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use state::{parse_identity, ChatCore};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `default_filter`. Calling this twice is harmless.
pub fn init_logging(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .try_init();
}
