//! # avafleet — Avalanche validator fleet manager
//!
//! Facade crate that re-exports the avafleet workspace crates so consumers
//! can depend on a single `avafleet` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | avafleet-core | Node, cluster, network and validator types, config, errors |
//! | [`runtime`] | avafleet-runtime | Registry, inventory, SSH gateway, cloud providers, probes |
//! | [`coordinator`] | avafleet-coordinator | Fleet operations, validator orchestration, local clusters |
//! | [`cli`] | avafleet-cli | Command line, output formatting, logging setup |

pub use avafleet_cli as cli;
pub use avafleet_coordinator as coordinator;
pub use avafleet_core as core;
pub use avafleet_runtime as runtime;
