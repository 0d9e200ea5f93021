// avafleet-cli: Clap commands, UI, output
// Depends on avafleet-core, avafleet-runtime, avafleet-coordinator

pub mod commands;
pub mod display;
pub mod http;
pub mod logging;
pub mod output;
pub mod ui;

pub use commands::run;
