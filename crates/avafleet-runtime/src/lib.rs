// avafleet-runtime: Registry persistence, remote execution, node probes, cloud adapters
// Depends on avafleet-core

pub mod cloud;
pub mod gateway;
pub mod inventory;
pub mod prober;
pub mod registry;
pub mod secrets;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;
