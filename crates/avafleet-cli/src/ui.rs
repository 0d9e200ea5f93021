use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use avafleet_coordinator::fan_out::{FleetOperationResult, NodeOutcome};

// ---------------------------------------------------------------------------
// Colored message helpers
// ---------------------------------------------------------------------------

fn prefix() -> String {
    "[avafleet]".bold().cyan().to_string()
}

/// Print an informational message: [avafleet] message
pub fn info(msg: &str) {
    println!("{} {}", prefix(), msg);
}

/// Print a success message in green.
pub fn success(msg: &str) {
    println!("{} {}", prefix(), msg.green());
}

/// Print an error message to stderr in red.
pub fn error(msg: &str) {
    eprintln!("{} {}", "[avafleet]".bold().red(), msg.red());
}

/// Print a warning message in yellow.
pub fn warn(msg: &str) {
    println!("{} {}", prefix(), msg.yellow());
}

// ---------------------------------------------------------------------------
// Fleet results
// ---------------------------------------------------------------------------

/// One line per node: done, already in the target state, or failed.
pub fn node_outcomes<R>(result: &FleetOperationResult<R>, done: &str) {
    for (node_id, outcome) in result.outcomes() {
        match outcome {
            NodeOutcome::Done(_) => println!("  {} {} {}", "✓".green(), node_id, done),
            NodeOutcome::Already(note) => println!("  {} {} {}", "•".dimmed(), node_id, note.dimmed()),
            NodeOutcome::Failed(reason) => eprintln!("  {} {} {}", "✗".red(), node_id, reason.red()),
        }
    }
}

/// Printed when cloud credentials expire mid-operation.
pub fn expired_credentials(profile: &str) {
    error(&format!("Cloud credentials for profile '{}' have expired.", profile));
    error(&format!(
        "  AWS: run `aws sso login --profile {}` or refresh ~/.aws/credentials.",
        profile
    ));
    error("  GCP: run `gcloud auth application-default login` or point [gcp] credentials_file at a valid key.");
    error("Nodes already processed keep their new state; re-run the command to finish the rest.");
}

// ---------------------------------------------------------------------------
// Interactive prompts
// ---------------------------------------------------------------------------

/// Show an interactive confirmation prompt. Returns true if confirmed.
pub fn confirm(msg: &str) -> bool {
    inquire::Confirm::new(msg)
        .with_default(false)
        .prompt()
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Spinners
// ---------------------------------------------------------------------------

/// Create and start a spinner with the given message.
/// Call `.finish_and_clear()` when done.
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.cyan} {msg}")
    {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}
