//! Transfer progress bars fed by session progress events (percent, 0..=100).

use indicatif::{ProgressBar, ProgressStyle};

pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    pub fn new(verb: &str, name: &str, byte_size: u64) -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("{msg} [{wide_bar:.cyan/blue}] {pos:>3}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_message(format!("{verb} {name} ({})", format_bytes(byte_size)));
        Self { bar }
    }

    pub fn update(&self, percent: u8) {
        self.bar.set_position(u64::from(percent.min(100)));
    }

    pub fn finish_with_message(&self, msg: String) {
        self.bar.set_position(100);
        self.bar.finish_with_message(msg);
    }

    /// Leave the bar where it stopped (peer went away).
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.2} {}", UNITS[unit])
}
