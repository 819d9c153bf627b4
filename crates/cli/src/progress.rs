//! Cargo-style progress output for cadex
//!
//! ```text
//!    Indexing 3 root(s) on build-box...
//!     Indexed 952 files (14 hashed, 938 unchanged, 1.20 GiB) in 0.41s
//!   Comparing 952 local vs 940 remote checksums
//!     Sending [======>                  ] 67.44 MiB/120.00 MiB src/main.rs
//!        Sent 12 files in 3.2s
//! ```

use std::io::Write as _;
use std::time::Instant;

use cadex_core::{IndexReport, StoreDiff};
use cadex_transport::TransferMessage;

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const INDEXING: &str = "Indexing";
    const INDEXED: &str = "Indexed";
    const COMPARING: &str = "Comparing";
    const SENDING: &str = "Sending";
    const SENT: &str = "Sent";
    const RECEIVED: &str = "Received";
    const UP_TO_DATE: &str = "Up-to-date";
}

/// Print a cargo-style status line
pub fn print_status(status: &str, message: &str) {
    let mut term = console::Term::stderr();
    let style = console::Style::new().green().bold();
    let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
}

/// Print a warning-coloured status line
pub fn print_warning(status: &str, message: &str) {
    let mut term = console::Term::stderr();
    let style = console::Style::new().yellow().bold();
    let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
}

fn size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Tracks one command's run time and prints its milestones
pub struct Progress {
    start: Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    fn elapsed(&self) -> String {
        let elapsed = self.start.elapsed();
        if elapsed.as_secs() >= 1 {
            format!("{:.2}s", elapsed.as_secs_f64())
        } else {
            format!("{}ms", elapsed.as_millis())
        }
    }

    pub fn indexing(&self, roots: usize, device: &str) {
        print_status(Status::INDEXING, &format!("{roots} root(s) on {device}..."));
    }

    /// Summarize an index run, listing per-entry failures
    pub fn indexed(&self, report: &IndexReport) {
        let stats = &report.stats;
        print_status(
            Status::INDEXED,
            &format!(
                "{} files ({} hashed, {} unchanged, {}) in {}",
                report.store.location_count(),
                stats.hashed,
                stats.skipped_unchanged,
                size(report.store.total_size()),
                self.elapsed()
            ),
        );
        for failure in &report.failures {
            print_warning("Failed", &failure.to_string());
        }
    }

    pub fn comparing(&self, local: usize, remote: usize) {
        print_status(
            Status::COMPARING,
            &format!("{local} local vs {remote} remote checksums"),
        );
    }

    pub fn diffed(&self, diff: &StoreDiff) {
        if diff.only_local.is_empty() {
            print_status(Status::UP_TO_DATE, "remote already has every local checksum");
        } else {
            print_status(
                "Missing",
                &format!(
                    "{} on remote, {} only on remote, {} shared",
                    diff.only_local.len(),
                    diff.only_remote.len(),
                    diff.shared
                ),
            );
        }
    }

    /// Byte progress bar for streaming files
    pub fn send_bar(&self, total_bytes: u64) -> indicatif::ProgressBar {
        let pb = indicatif::ProgressBar::new(total_bytes);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} {msg:>12} [{bar:25.cyan/dim}] {binary_bytes}/{binary_total_bytes} {prefix:.dim}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("=> ");
        pb.set_style(style);
        pb.set_message(Status::SENDING);
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb
    }

    pub fn sent(&self, files: usize, bytes: u64) {
        print_status(
            Status::SENT,
            &format!("{files} files ({}) in {}", size(bytes), self.elapsed()),
        );
    }

    pub fn received(message: &TransferMessage) {
        match message {
            TransferMessage::Text { text, peer } => {
                print_status(Status::RECEIVED, &format!("text from {peer}: {text}"));
            }
            TransferMessage::File(file) => print_status(
                Status::RECEIVED,
                &format!(
                    "{} ({}, {}) from {} -> {}",
                    file.name,
                    size(file.size),
                    file.checksum,
                    file.peer,
                    file.path.display()
                ),
            ),
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}
