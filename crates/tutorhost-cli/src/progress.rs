use std::env;
use std::io::{self, IsTerminal, Write};

use tutorhost_domain::{DownloadProgress, PhaseEvent};

pub(crate) fn progress_enabled(quiet: bool, json: bool) -> bool {
    if quiet || json {
        return false;
    }
    match env::var("TUTORHOST_PROGRESS") {
        Ok(value) => value != "0",
        Err(_) => io::stderr().is_terminal(),
    }
}

/// A single status line on stderr, redrawn in place.
pub(crate) struct ProgressLine {
    enabled: bool,
    drawn: bool,
}

impl ProgressLine {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            drawn: false,
        }
    }

    pub(crate) fn update(&mut self, text: &str) {
        if !self.enabled {
            return;
        }
        let line = format!("\r\x1b[2Ktutorhost ▸ {text}");
        let mut stderr = io::stderr();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
        self.drawn = true;
    }

    pub(crate) fn clear(&mut self) {
        if self.drawn {
            let mut stderr = io::stderr();
            let _ = stderr.write_all(b"\r\x1b[2K");
            let _ = stderr.flush();
            self.drawn = false;
        }
    }
}

impl Drop for ProgressLine {
    fn drop(&mut self) {
        self.clear();
    }
}

pub(crate) fn describe_phase(event: &PhaseEvent) -> String {
    let mut text = format!("[{:>3}%] {}: {}", event.percent, event.phase, event.status);
    if let Some(downloaded) = event.bytes_downloaded {
        text.push_str(&format!(" ({})", bytes_ratio(downloaded, event.total_bytes)));
    }
    text
}

pub(crate) fn describe_download(progress: DownloadProgress) -> String {
    match progress.total_bytes {
        Some(_) => format!(
            "{:>3}% ({})",
            progress.percent,
            bytes_ratio(progress.bytes_downloaded, progress.total_bytes)
        ),
        None => format_bytes(progress.bytes_downloaded),
    }
}

fn bytes_ratio(downloaded: u64, total: Option<u64>) -> String {
    match total {
        Some(total) => format!("{}/{}", format_bytes(downloaded), format_bytes(total)),
        None => format_bytes(downloaded),
    }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
