//! Local persistence
//!
//! Every store here seals its payloads with the key manager before they reach
//! SQLite and runs multi-statement writes in a single transaction.

mod dr_keys;
mod messages;
mod pool;
mod prekeys;
mod ratchet_states;
mod shared_secrets;
mod users;

pub use dr_keys::LocalKeyStore;
pub use messages::{MessageListener, MessageStore, MAX_KEY_COLLISIONS};
pub use pool::{open_in_memory, open_pool};
pub use prekeys::PreKeyStore;
pub use ratchet_states::RatchetStateStore;
pub use shared_secrets::SharedSecretStore;
pub use users::UserStorage;

#[cfg(test)]
pub(crate) async fn test_pool() -> sqlx::SqlitePool {
    open_in_memory().await.unwrap()
}
