//! `progress`: pass-through stage that reports how many records went by.

use super::Filter;
use crate::streaming::channel::Entry;
use anyhow::Result;
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::time::Duration;

/// Records between log lines when no terminal is attached
const LOG_EVERY: u64 = 500;

pub struct Progress {
    label: String,
    count: u64,
    bar: Option<ProgressBar>,
}

impl Progress {
    /// Spinner on stderr when it is a terminal and progress isn't disabled via
    /// `DEPOTSYNC_PROGRESS=false`; periodic debug logs otherwise.
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let enabled = std::io::stderr().is_terminal()
            && std::env::var("DEPOTSYNC_PROGRESS").map(|v| v != "false").unwrap_or(true);
        let bar = enabled.then(|| {
            let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
            bar.set_style(
                ProgressStyle::with_template("{spinner} {prefix}: {pos} records ({per_sec})")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.set_prefix(label.clone());
            bar.enable_steady_tick(Duration::from_millis(200));
            bar
        });
        Self {
            label,
            count: 0,
            bar,
        }
    }

    /// Never draws; only counts and logs.
    pub fn hidden(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            count: 0,
            bar: None,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

#[async_trait]
impl Filter for Progress {
    fn name(&self) -> &'static str {
        "progress"
    }

    async fn keep(&mut self, _entry: &Entry) -> Result<bool> {
        self.count += 1;
        match &self.bar {
            Some(bar) => bar.inc(1),
            None if self.count % LOG_EVERY == 0 => {
                tracing::debug!(stage = %self.label, records = self.count, "progress");
            }
            None => {}
        }
        Ok(true)
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        tracing::debug!(stage = %self.label, records = self.count, "progress done");
    }
}
