// Output formatting helpers for CLI commands

use std::time::Duration;

/// Print a status message: "     Running /build/compile"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

/// Print a dim/muted message
pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

/// Print a header line
pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

/// Print the outcome of one leaf: "    OK /build/compile (1.20s) [run-1:/build]"
pub fn leaf_exit(path: &str, scope: &str, exit_code: i32, duration: Duration) {
    let line = format!(
        "{} ({:.2}s) \x1b[2m[{}]\x1b[0m",
        path,
        duration.as_secs_f64(),
        scope
    );
    if exit_code == 0 {
        eprintln!("\x1b[32m{:>8}\x1b[0m {}", "OK", line);
    } else {
        eprintln!("\x1b[31m{:>8}\x1b[0m {} exit code {}", "FAIL", line, exit_code);
    }
}
