//! Data models shared by the stores, the coordinator and the host handle

mod types;

pub use types::*;
