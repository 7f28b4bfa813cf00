//! Stage composition.
//!
//! A [`Pipeline`] is an ordered list of stages. Each stage runs as its own
//! task, connected to its neighbours by bounded channels:
//!
//! ```text
//! source --> filter --> filter --> [batcher --> dispatcher] --> ... --> sink
//! ```

use crate::batch::run_batcher;
use crate::dispatch::Dispatcher;
use crate::filter::{run_filter, Filter};
use crate::streaming::channel::{
    batch_channel, entry_channel, Entry, EntryReceiver, DEFAULT_BATCH_BYTES, DEFAULT_WORKERS,
    STAGE_CHANNEL_SIZE,
};
use crate::streaming::codec::write_from;
use crate::transfer::{TransferExecutor, TransferMode};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;

/// Sizing shared by every pipeline a run builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub channel_capacity: usize,
    pub batch_bytes: u64,
    pub workers: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            channel_capacity: STAGE_CHANNEL_SIZE,
            batch_bytes: DEFAULT_BATCH_BYTES,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// What one stage saw and passed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: &'static str,
    pub seen: u64,
    pub forwarded: u64,
    /// Entries annotated as failed by a transfer stage
    pub failed: u64,
}

enum Stage {
    Filter(Box<dyn Filter>),
    Transfer {
        executor: Arc<dyn TransferExecutor>,
        mode: TransferMode,
    },
}

pub struct Pipeline {
    options: PipelineOptions,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            options,
            stages: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: impl Filter + 'static) -> Self {
        self.stages.push(Stage::Filter(Box::new(filter)));
        self
    }

    /// Append a batcher and dispatcher pair.
    pub fn transfer(mut self, executor: Arc<dyn TransferExecutor>, mode: TransferMode) -> Self {
        self.stages.push(Stage::Transfer { executor, mode });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Start every stage. The returned run owns the tail of the chain.
    pub fn spawn(self, source: EntryReceiver) -> PipelineRun {
        let capacity = self.options.channel_capacity;
        let mut rx = source;
        let mut tasks = Vec::with_capacity(self.stages.len());

        for stage in self.stages {
            let (tx, next_rx) = entry_channel(capacity);
            let handle: JoinHandle<Result<StageReport>> = match stage {
                Stage::Filter(mut filter) => tokio::spawn(async move {
                    let name = filter.name();
                    let stats = run_filter(filter.as_mut(), rx, tx).await?;
                    Ok(StageReport {
                        name,
                        seen: stats.seen,
                        forwarded: stats.forwarded,
                        failed: 0,
                    })
                }),
                Stage::Transfer { executor, mode } => {
                    let (batch_tx, batch_rx) = batch_channel();
                    let batcher = tokio::spawn(run_batcher(rx, batch_tx, self.options.batch_bytes));
                    let dispatcher = Dispatcher::new(executor, self.options.workers, mode);
                    tokio::spawn(async move {
                        let stats = dispatcher.run(batch_rx, tx).await?;
                        batcher.await??;
                        let name = match mode {
                            TransferMode::Normal => "transfer",
                            TransferMode::Force => "transfer --force",
                        };
                        Ok(StageReport {
                            name,
                            seen: stats.transferred + stats.failed,
                            forwarded: stats.transferred + stats.failed,
                            failed: stats.failed,
                        })
                    })
                }
            };
            tasks.push(handle);
            rx = next_rx;
        }

        PipelineRun { output: rx, tasks }
    }

    /// Run `entries` through every stage and collect what comes out.
    pub async fn collect(self, entries: Vec<Entry>) -> Result<(Vec<Entry>, Vec<StageReport>)> {
        let (tx, rx) = entry_channel(self.options.channel_capacity);
        let source = tokio::spawn(async move {
            for entry in entries {
                if tx.send(entry).await.is_err() {
                    break;
                }
            }
        });

        let mut run = self.spawn(rx);
        let mut out = Vec::new();
        while let Some(entry) = run.output.recv().await {
            out.push(entry);
        }
        source.await.context("pipeline source panicked")?;
        let reports = run.finish().await?;
        Ok((out, reports))
    }
}

/// A started pipeline.
pub struct PipelineRun {
    /// Entries leaving the last stage
    pub output: EntryReceiver,
    tasks: Vec<JoinHandle<Result<StageReport>>>,
}

impl PipelineRun {
    /// Wait for every stage.
    ///
    /// A failing stage closes its input, so the stages above it fail with
    /// "downstream closed". The error of the last failing stage is returned.
    pub async fn finish(self) -> Result<Vec<StageReport>> {
        drop(self.output);
        join_stages(self.tasks).await
    }

    /// Write everything leaving the last stage to `writer`, then wait for
    /// every stage. A write error wins over the stage errors it causes.
    pub async fn drain_to<W: AsyncWrite + Unpin>(self, writer: W) -> Result<(u64, Vec<StageReport>)> {
        let written = write_from(self.output, writer).await;
        let reports = join_stages(self.tasks).await;
        let written = written?;
        Ok((written, reports?))
    }
}

async fn join_stages(tasks: Vec<JoinHandle<Result<StageReport>>>) -> Result<Vec<StageReport>> {
    let mut reports = Vec::with_capacity(tasks.len());
    let mut last_err = None;
    for task in tasks {
        match task.await.context("pipeline stage panicked") {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(e)) | Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(reports),
    }
}
