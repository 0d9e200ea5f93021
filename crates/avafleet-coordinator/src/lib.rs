// avafleet-coordinator: Fleet fan-out, validator registration, cluster transfer, local clusters
// Depends on avafleet-core and avafleet-runtime

pub mod chain;
pub mod fan_out;
pub mod fleet;
pub mod local;
pub mod preflight;
pub mod transfer;
pub mod validator;
