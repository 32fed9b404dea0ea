//! Pipeline orchestration
//!
//! [`Pipeline::run`] takes the work items of a manifest and carries each one
//! through fetch, process and upload:
//!
//! - a bounded pool of workers (`concurrency.workers`) runs items in parallel,
//!   the stages of one item run in order
//! - each stage has its own limit (`concurrency.fetch`, `.process`, `.upload`)
//! - every worker reports exactly one [`ItemOutcome`] over a channel; only the
//!   orchestrator assembles the [`RunReport`]
//! - progress is published as [`Event`]s on a broadcast channel
//!
//! Tripping the cancellation token stops dispatch: undispatched items are
//! reported as not started, in-flight items finish their current stage
//! operation and then fail as interrupted, and scratch is swept before the
//! report is returned.

mod report;
mod worker;

pub use report::{ItemError, ItemOutcome, RunReport, StageAttempts, Totals};

use crate::config::{Config, ConcurrencyConfig, RetryConfig};
use crate::error::Result;
use crate::fetch::{Fetcher, SourceFetcher};
use crate::process::{MediaProcessor, Processor};
use crate::scratch::ScratchDir;
use crate::types::{Event, WorkItem, WorkItemId};
use crate::upload::{Uploader, destination_from_config};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use worker::{StageLimits, WorkerContext};

/// Buffer size of the event channel; slow subscribers lose the oldest events
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Fetch → process → upload pipeline
pub struct Pipeline {
    fetcher: Arc<dyn SourceFetcher>,
    processor: Arc<dyn MediaProcessor>,
    uploader: Arc<Uploader>,
    scratch: ScratchDir,
    concurrency: ConcurrencyConfig,
    fetch_retry: RetryConfig,
    upload_retry: RetryConfig,
    sweep_on_start: bool,
    event_tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Build the pipeline and all of its components from configuration
    ///
    /// # Errors
    ///
    /// Fails when the scratch directory cannot be created, the HTTP client
    /// cannot be built, or the destination is misconfigured.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let scratch = ScratchDir::open(&config.scratch.dir).await?;
        let fetcher = Arc::new(Fetcher::from_config(config)?);
        let processor = Arc::new(Processor::from_config(config));
        let destination = destination_from_config(config).await?;
        let uploader = Arc::new(Uploader::new(destination, &config.upload));
        Ok(Self::new(config, scratch, fetcher, processor, uploader))
    }

    /// Assemble a pipeline from ready-made components
    pub fn new(
        config: &Config,
        scratch: ScratchDir,
        fetcher: Arc<dyn SourceFetcher>,
        processor: Arc<dyn MediaProcessor>,
        uploader: Arc<Uploader>,
    ) -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            fetcher,
            processor,
            uploader,
            scratch,
            concurrency: config.concurrency.clone(),
            fetch_retry: config.fetch.retry.clone(),
            upload_retry: config.upload.retry.clone(),
            sweep_on_start: config.scratch.sweep_on_start,
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to run events
    ///
    /// Each subscriber receives every event sent after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Token that stops the run when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Scratch directory in use
    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    /// Uploader in use
    pub fn uploader(&self) -> &Arc<Uploader> {
        &self.uploader
    }

    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Run every item to a terminal status and report the outcome
    ///
    /// One item failing never stops the others. The returned report lists the
    /// items in the order given; when two items share an id only the first is
    /// run and reported.
    pub async fn run(&self, items: Vec<WorkItem>) -> RunReport {
        let started_at = Utc::now();
        let items = dedup_items(items);

        if self.sweep_on_start
            && let Err(e) = self.scratch.sweep().await
        {
            warn!(scratch = ?self.scratch.path(), error = %e, "startup sweep failed");
        }

        info!(
            items = items.len(),
            workers = self.concurrency.workers,
            fetch = self.concurrency.fetch,
            process = self.concurrency.process,
            upload = self.concurrency.upload,
            "starting run"
        );

        for item in &items {
            self.emit(Event::Queued {
                id: item.id.clone(),
                url: item.source_url.clone(),
            });
        }

        let order: Vec<WorkItem> = items.clone();
        let context = WorkerContext {
            fetcher: Arc::clone(&self.fetcher),
            processor: Arc::clone(&self.processor),
            uploader: Arc::clone(&self.uploader),
            scratch: self.scratch.clone(),
            limits: Arc::new(StageLimits {
                fetch: Semaphore::new(self.concurrency.fetch),
                process: Semaphore::new(self.concurrency.process),
                upload: Semaphore::new(self.concurrency.upload),
            }),
            fetch_retry: self.fetch_retry.clone(),
            upload_retry: self.upload_retry.clone(),
            event_tx: self.event_tx.clone(),
            cancel: self.cancel.clone(),
        };

        // One slot per item, so a worker never waits to report
        let (outcome_tx, mut outcome_rx) = mpsc::channel::<ItemOutcome>(items.len().max(1));
        let workers = Arc::new(Semaphore::new(self.concurrency.workers));
        let mut outcomes: HashMap<WorkItemId, ItemOutcome> = HashMap::with_capacity(items.len());
        let mut dispatched: HashSet<WorkItemId> = HashSet::with_capacity(items.len());

        for item in items {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            dispatched.insert(item.id.clone());
            let context = context.clone();
            let outcome_tx = outcome_tx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let outcome = context.run(item).await;
                outcome_tx.send(outcome).await.ok();
            });
        }
        drop(outcome_tx);

        // Ends once every spawned worker has reported or died
        while let Some(outcome) = outcome_rx.recv().await {
            outcomes.insert(outcome.id.clone(), outcome);
        }

        let interrupted = self.cancel.is_cancelled();
        if interrupted {
            self.emit(Event::Shutdown);
            match self.scratch.sweep().await {
                Ok(stats) => info!(files = stats.files_removed, "scratch swept after shutdown"),
                Err(e) => warn!(error = %e, "scratch sweep after shutdown failed"),
            }
        }

        let mut item_outcomes = Vec::with_capacity(order.len());
        for item in &order {
            let outcome = match outcomes.remove(&item.id) {
                Some(outcome) => outcome,
                None if !dispatched.contains(&item.id) => ItemOutcome::not_started(item),
                None => {
                    warn!(item_id = %item.id, "no outcome reported for item");
                    let removed = self.scratch.remove_item_files(&item.id).await;
                    if removed > 0 {
                        info!(item_id = %item.id, files = removed, "removed scratch files of lost item");
                    }
                    ItemOutcome::lost(item)
                }
            };
            item_outcomes.push(outcome);
        }

        let report = RunReport::new(started_at, interrupted, item_outcomes);
        self.emit(Event::RunComplete {
            uploaded: report.totals.uploaded,
            failed: report.totals.failed,
            not_started: report.totals.not_started,
        });
        info!(
            uploaded = report.totals.uploaded,
            failed = report.totals.failed,
            not_started = report.totals.not_started,
            "run complete"
        );
        report
    }
}

/// Keep the first item of each id
fn dedup_items(items: Vec<WorkItem>) -> Vec<WorkItem> {
    let mut seen: HashSet<WorkItemId> = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| {
            let first = seen.insert(item.id.clone());
            if !first {
                warn!(item_id = %item.id, url = %item.source_url, "duplicate item id, skipping");
            }
            first
        })
        .collect()
}
