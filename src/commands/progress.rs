//! indicatif progress reporting for dumps

use asmtool_core::DumpProgress;
use indicatif::{ProgressBar, ProgressStyle};

fn create_progress_bar_style() -> Result<ProgressStyle, Box<dyn std::error::Error>> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")?
        .progress_chars("#>-"))
}

/// Progress bar driven by [`DumpProgress`] callbacks
pub struct IndicatifProgress {
    bar: Option<ProgressBar>,
    message: &'static str,
}

impl IndicatifProgress {
    pub fn new(message: &'static str) -> Self {
        Self { bar: None, message }
    }
}

impl DumpProgress for IndicatifProgress {
    fn start(&mut self, total: u64) {
        let pb = ProgressBar::new(total);
        pb.set_style(create_progress_bar_style().unwrap_or_else(|_| ProgressStyle::default_bar()));
        pb.set_message(self.message);
        self.bar = Some(pb);
    }

    fn advance(&mut self, done: u64) {
        if let Some(pb) = &self.bar {
            pb.set_position(done);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.finish_and_clear();
        }
    }
}
