// avafleet-core: Pure types, error kinds, config, utilities
// No internal avafleet dependencies; this is the foundation crate.

pub mod cluster;
pub mod config;
pub mod error;
pub mod naming;
pub mod network;
pub mod node;
pub mod retry;
pub mod time;
pub mod validator;
