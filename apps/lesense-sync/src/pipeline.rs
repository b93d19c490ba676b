use crate::checkpoint::{self, Cursor};
use crate::config::{Credentials, MissingCredential};
use crate::mapper;
use crate::sink::{DeviceSink, SinkError, SinkVariable};
use crate::source::{SensorSource, SourceFetchError, SourceRecord};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;


/// Where a run aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Start,
    CheckpointRead,
    Fetch,
    Write,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::Start => "start",
            SyncStage::CheckpointRead => "checkpoint_read",
            SyncStage::Fetch => "fetch",
            SyncStage::Write => "write",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("missing {0} configuration")]
    Configuration(MissingCredential),
    #[error("failed to read checkpoint: {0}")]
    CheckpointRead(#[source] SinkError),
    #[error("failed to fetch lesense readings: {0}")]
    SourceFetch(#[from] SourceFetchError),
    #[error("failed to write readings: {0}")]
    SinkWrite(#[source] SinkError),
}

impl SyncError {
    pub fn stage(&self) -> SyncStage {
        match self {
            SyncError::Configuration(_) => SyncStage::Start,
            SyncError::CheckpointRead(_) => SyncStage::CheckpointRead,
            SyncError::SourceFetch(_) => SyncStage::Fetch,
            SyncError::SinkWrite(_) => SyncStage::Write,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing new upstream; nothing was written.
    UpToDate { checkpoint: Option<Cursor> },
    Imported {
        records: usize,
        previous: Option<Cursor>,
        checkpoint: Cursor,
    },
}

/// Everything one run needs. Built once per invocation by `main`.
#[derive(Clone)]
pub struct SyncContext {
    pub credentials: Credentials,
    pub source: Arc<dyn SensorSource>,
    pub sink: Arc<dyn DeviceSink>,
}

impl SyncContext {
    pub fn new(
        credentials: Credentials,
        source: Arc<dyn SensorSource>,
        sink: Arc<dyn DeviceSink>,
    ) -> Self {
        Self {
            credentials,
            source,
            sink,
        }
    }
}

pub async fn run_sync(ctx: &SyncContext) -> Result<SyncOutcome, SyncError> {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("lesense_sync", %run_id);
    async {
        let started = Instant::now();
        tracing::info!("running");
        let result = run_stages(ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(SyncOutcome::UpToDate { checkpoint }) => {
                tracing::info!(
                    checkpoint = ?checkpoint.map(Cursor::collected),
                    elapsed_ms,
                    "no new readings; run successfully finished"
                );
            }
            Ok(SyncOutcome::Imported {
                records,
                previous,
                checkpoint,
            }) => {
                tracing::info!(
                    records,
                    previous = ?previous.map(Cursor::collected),
                    checkpoint = checkpoint.collected(),
                    elapsed_ms,
                    "run successfully finished"
                );
            }
            Err(err) => {
                tracing::error!(stage = %err.stage(), error = %err, elapsed_ms, "run aborted");
            }
        }
        result
    }
    .instrument(span)
    .await
}

async fn run_stages(ctx: &SyncContext) -> Result<SyncOutcome, SyncError> {
    let (device_token, lesense_token) = ctx
        .credentials
        .require()
        .map_err(SyncError::Configuration)?;

    let previous = checkpoint::read(ctx.sink.as_ref(), device_token)
        .await
        .map_err(SyncError::CheckpointRead)?;
    match previous {
        Some(cursor) => tracing::debug!(%cursor, "resuming after checkpoint"),
        None => tracing::info!("no checkpoint stored; importing the default feed window"),
    }

    let page = ctx.source.fetch(lesense_token, previous).await?;
    let fetched = page.items.len();
    let (records, dropped) = checkpoint::retain_unseen(page.items, previous);
    if dropped > 0 {
        tracing::warn!(dropped, fetched, "discarded readings already covered by checkpoint");
    }

    let Some(next) = checkpoint::next(&records) else {
        return Ok(SyncOutcome::UpToDate {
            checkpoint: previous,
        });
    };

    let batch = build_batch(&records, next);
    let written = ctx
        .sink
        .insert(device_token, &batch)
        .await
        .map_err(SyncError::SinkWrite)?;
    tracing::debug!(written, "batch stored");

    Ok(SyncOutcome::Imported {
        records: records.len(),
        previous,
        checkpoint: next,
    })
}

/// Mapped readings in fetch order, with the checkpoint entry last.
fn build_batch(records: &[SourceRecord], next: Cursor) -> Vec<SinkVariable> {
    let mut batch: Vec<SinkVariable> = Vec::with_capacity(records.len() + 1);
    batch.extend(records.iter().map(mapper::map_record));
    batch.push(checkpoint::entry(next));
    batch
}
