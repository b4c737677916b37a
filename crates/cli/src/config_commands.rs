use std::path::Path;

use {
    anyhow::Result,
    courier_config::{Diagnostic, Severity, validate},
};

const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// `courier check-config`: print diagnostics, exit non-zero on errors.
pub fn check(path: Option<&Path>, verbose: bool) -> Result<()> {
    let result = validate(path);

    match &result.config_path {
        Some(path) => eprintln!("Checking {}\n", path.display()),
        None => eprintln!("No config file found; checking defaults.\n"),
    }

    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }
        eprintln!("  {}", render(d));
        shown += 1;
    }
    if shown > 0 {
        eprintln!();
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);
    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn render(d: &Diagnostic) -> String {
    let (color, label) = match d.severity {
        Severity::Error => (RED, "error"),
        Severity::Warning => (YELLOW, "warning"),
        Severity::Info => (CYAN, "info"),
    };
    if d.path.is_empty() {
        format!("{BOLD}{color}{label}{RESET} {}", d.message)
    } else {
        format!("{BOLD}{color}{label}{RESET} {}: {}", d.path, d.message)
    }
}
