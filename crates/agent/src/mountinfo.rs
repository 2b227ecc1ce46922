//! Kernel mount table inspection.
//!
//! The mount executor and the process registry both decide idempotence
//! from what the kernel actually has mounted, not from what they remember.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MOUNTS_FILE: &str = "/proc/self/mounts";

/// Whether the kernel currently reports `path` as a mount point.
pub fn is_mount_point(path: &Path) -> io::Result<bool> {
    let content = std::fs::read_to_string(MOUNTS_FILE)?;
    Ok(mount_points(&content).iter().any(|p| p == path))
}

/// Poll until the kernel reports `path` mounted, or the deadline passes.
pub async fn wait_for_mount(path: &Path, deadline: Duration) -> io::Result<bool> {
    let poll = Duration::from_millis(500);
    let start = tokio::time::Instant::now();

    loop {
        if is_mount_point(path)? {
            return Ok(true);
        }
        if start.elapsed() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(poll).await;
    }
}

/// Mount points from a mounts-table blob. Second whitespace-separated
/// field of each line, octal escapes decoded.
fn mount_points(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_path)
        .map(PathBuf::from)
        .collect()
}

/// The kernel escapes space, tab, newline and backslash in mount paths as
/// three-digit octal sequences (`\040` and friends).
fn unescape_mount_path(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 {
            if let Ok(code) = u8::from_str_radix(&digits, 8) {
                out.push(code as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(c);
    }

    out
}
