//! stderr diagnostics
//!
//! Scan results own stdout; everything else goes to stderr with a short
//! `component initial + pid` prefix so interleaved drone output stays
//! attributable.

/// Prefix for one process component, e.g. `M12345`.
pub fn component_prefix(component: char) -> String {
    format!("{}{}", component, std::process::id())
}

/// Print a fatal error line to stderr.
pub fn fatal(component: char, message: &str) {
    eprintln!("{}: {}", component_prefix(component), message);
}
