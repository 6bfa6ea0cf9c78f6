//! CLI command implementations.

pub mod parsers;
pub mod port;
pub mod share;
pub mod usb;
pub mod vm;

use serde::Serialize;
use std::io::Write;

// ============================================================================
// Display Constants
// ============================================================================

/// Display width for VM names in tables.
pub const NAME_WIDTH: usize = 20;

// ============================================================================
// Display Helpers
// ============================================================================

/// Truncate a string to max length, adding "..." if needed.
///
/// If the string fits within `max` characters, returns it unchanged.
/// Otherwise, truncates to `max - 3` characters and appends "...".
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else if max <= 3 {
        "...".to_string()
    } else {
        let head: String = s.chars().take(max - 3).collect();
        format!("{}...", head)
    }
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> localvm::Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(std::io::Error::from)?;
    println!("{}", json);
    Ok(())
}

/// "yes"/"no" for boolean columns.
pub fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Flush stdout and stderr, ignoring errors.
///
/// Used to ensure output is visible before blocking operations.
pub fn flush_output() {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}
