//! Private chat sessions

mod coordinator;
mod handlers;

pub use coordinator::SessionCoordinator;
pub use handlers::{MessagesHandler, OneTimePreKeysHandler};
