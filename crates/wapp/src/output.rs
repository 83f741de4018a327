//! Output helpers: results go to stdout as JSON, status lines to stderr.

use std::io::{self, IsTerminal, Write};

use owo_colors::OwoColorize;
use serde_json::Value;

/// Whether stderr should carry color codes.
fn stderr_color() -> bool {
    io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

/// Pretty-printed JSON on stdout, respecting quiet mode.
pub fn print_json(value: &Value, quiet: bool) {
    if quiet {
        return;
    }
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{rendered}");
}

/// One compact JSON document per line; used for streams.
pub fn print_json_line(value: &Value) {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{value}");
    let _ = stdout.flush();
}

/// A status line on stderr, dimmed when interactive.
pub fn status(message: &str, quiet: bool) {
    if quiet {
        return;
    }
    if stderr_color() {
        eprintln!("{}", message.dimmed());
    } else {
        eprintln!("{message}");
    }
}

/// A success line on stderr.
pub fn success(message: &str) {
    if stderr_color() {
        eprintln!("{} {message}", "✓".green());
    } else {
        eprintln!("✓ {message}");
    }
}
