//! Per-item worker: drives one work item through fetch, process and upload

use super::report::{ItemError, ItemOutcome, StageAttempts};
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::fetch::SourceFetcher;
use crate::process::MediaProcessor;
use crate::retry::{RetryFailure, with_retry};
use crate::scratch::ScratchDir;
use crate::types::{Event, Stage, Status, UploadReceipt, WorkItem};
use crate::upload::Uploader;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, SemaphorePermit, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Independent concurrency limits per stage
pub(crate) struct StageLimits {
    pub(crate) fetch: Semaphore,
    pub(crate) process: Semaphore,
    pub(crate) upload: Semaphore,
}

impl StageLimits {
    fn for_stage(&self, stage: Stage) -> &Semaphore {
        match stage {
            Stage::Fetch => &self.fetch,
            Stage::Process => &self.process,
            Stage::Upload => &self.upload,
        }
    }
}

/// Everything a worker needs, shared across all workers of a run
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) fetcher: Arc<dyn SourceFetcher>,
    pub(crate) processor: Arc<dyn MediaProcessor>,
    pub(crate) uploader: Arc<Uploader>,
    pub(crate) scratch: ScratchDir,
    pub(crate) limits: Arc<StageLimits>,
    pub(crate) fetch_retry: RetryConfig,
    pub(crate) upload_retry: RetryConfig,
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) cancel: CancellationToken,
}

/// Mutable bookkeeping for one item while it runs
#[derive(Default)]
struct Progress {
    stage: Option<Stage>,
    attempts: StageAttempts,
}

impl WorkerContext {
    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Run one item to a terminal status and describe how it ended
    pub(crate) async fn run(&self, mut item: WorkItem) -> ItemOutcome {
        if self.cancel.is_cancelled() {
            return ItemOutcome::not_started(&item);
        }

        let span = info_span!("item", item_id = %item.id);
        let started = Instant::now();
        let mut progress = Progress::default();

        let result = self
            .drive(&mut item, &mut progress)
            .instrument(span.clone())
            .await;

        let mut outcome = ItemOutcome::not_started(&item);
        outcome.attempts = progress.attempts;

        match result {
            Ok(receipt) => {
                outcome.location = Some(self.uploader.destination().describe(&receipt.remote_id));
                outcome.remote_id = Some(receipt.remote_id);
            }
            Err(e) => {
                let stage = e.stage().or(progress.stage);
                let kind = e.kind();
                let message = e.to_string();
                span.in_scope(|| {
                    error!(stage = ?stage, kind = ?kind, error = %message, url = %item.source_url, "item failed");
                });

                if !item.status().is_terminal()
                    && let Ok(from) = item.transition(Status::Failed)
                {
                    self.emit(Event::StatusChanged {
                        id: item.id.clone(),
                        from,
                        to: Status::Failed,
                    });
                }
                self.emit(Event::Failed {
                    id: item.id.clone(),
                    stage,
                    kind,
                    error: message.clone(),
                });
                outcome.error = Some(ItemError {
                    kind,
                    stage,
                    message,
                });
            }
        }

        let removed = self.scratch.remove_item_files(&item.id).await;
        span.in_scope(|| debug!(files = removed, "scratch cleaned"));

        outcome.status = item.status();
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        outcome
    }

    async fn drive(&self, item: &mut WorkItem, progress: &mut Progress) -> Result<UploadReceipt> {
        // Fetch
        let permit = self.enter_stage(item, Stage::Fetch, progress).await?;
        let fetched = {
            let item: &WorkItem = item;
            with_retry(
                &self.fetch_retry,
                &self.cancel,
                |attempt, e| self.retry_scheduled(item, Stage::Fetch, attempt, e),
                || self.fetcher.fetch(item, &self.scratch),
            )
            .await
        };
        let fetched = match fetched {
            Ok(retried) => {
                progress.attempts.fetch = retried.attempts;
                let mut fetched = retried.value;
                fetched.attempts = retried.attempts;
                fetched
            }
            Err(failure) => {
                progress.attempts.fetch = failure.attempts();
                return Err(stage_failure(failure));
            }
        };
        drop(permit);

        info!(bytes = fetched.size_bytes, sha256 = %fetched.sha256, attempts = fetched.attempts, "source fetched");
        item.scratch_path = Some(fetched.local_path.clone());
        self.advance(item, Status::Fetched)?;

        // Process: a single attempt; a timed-out or failed tool run is not retried
        let permit = self.enter_stage(item, Stage::Process, progress).await?;
        progress.attempts.process = 1;
        let processed = self
            .processor
            .process(item, &fetched, &self.scratch)
            .await?;
        drop(permit);

        if processed.output_path != fetched.local_path
            && let Err(e) = tokio::fs::remove_file(&fetched.local_path).await
        {
            warn!(path = ?fetched.local_path, error = %e, "failed to remove fetched source");
        }
        info!(
            profile = %processed.format.profile,
            content_type = %processed.format.content_type,
            bytes = processed.format.size_bytes,
            "artifact ready"
        );
        item.scratch_path = Some(processed.output_path.clone());
        self.advance(item, Status::Processed)?;

        // Upload
        let permit = self.enter_stage(item, Stage::Upload, progress).await?;
        let uploaded = {
            let item: &WorkItem = item;
            with_retry(
                &self.upload_retry,
                &self.cancel,
                |attempt, e| self.retry_scheduled(item, Stage::Upload, attempt, e),
                || self.uploader.upload(item, &processed),
            )
            .await
        };
        let receipt = match uploaded {
            Ok(retried) => {
                progress.attempts.upload = retried.attempts;
                retried.value
            }
            Err(failure) => {
                progress.attempts.upload = failure.attempts();
                return Err(stage_failure(failure));
            }
        };
        drop(permit);

        self.advance(item, Status::Uploaded)?;
        info!(
            remote_id = %receipt.remote_id,
            attempts = progress.attempts.upload,
            "item uploaded"
        );
        Ok(receipt)
    }

    /// Wait for a stage slot unless shutdown was requested
    async fn enter_stage(
        &self,
        item: &WorkItem,
        stage: Stage,
        progress: &mut Progress,
    ) -> Result<SemaphorePermit<'_>> {
        progress.stage = Some(stage);
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::ShuttingDown),
            permit = self.limits.for_stage(stage).acquire() => {
                permit.map_err(|_| Error::ShuttingDown)?
            }
        };

        debug!(stage = %stage, "stage started");
        self.emit(Event::StageStarted {
            id: item.id.clone(),
            stage,
        });
        Ok(permit)
    }

    fn advance(&self, item: &mut WorkItem, next: Status) -> Result<()> {
        let from = item.transition(next)?;
        self.emit(Event::StatusChanged {
            id: item.id.clone(),
            from,
            to: next,
        });
        Ok(())
    }

    fn retry_scheduled(
        &self,
        item: &WorkItem,
        stage: Stage,
        attempt: u32,
        error: &impl std::fmt::Display,
    ) {
        self.emit(Event::RetryScheduled {
            id: item.id.clone(),
            stage,
            attempt,
            error: error.to_string(),
        });
    }
}

/// Turn a retry failure into the item's terminal error
fn stage_failure<E: Into<Error> + std::fmt::Display>(failure: RetryFailure<E>) -> Error {
    match failure {
        RetryFailure::Failed { error, .. } => error.into(),
        RetryFailure::Interrupted { last_error, .. } => {
            warn!(error = %last_error, "retry abandoned for shutdown");
            Error::ShuttingDown
        }
    }
}
