//! Two-phase sync pipeline.
//!
//! **Discovery** pages through MediaHaven and records every new identifier as
//! a pending item. **Update** then asks the request API to refresh each item
//! that has not been updated yet, one at a time with a fixed delay between
//! requests, and stores the outcome before moving on. Both phases are
//! resumable: ids are inserted at most once and only unfinished items are
//! picked up again.

pub mod error;

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use crate::mediahaven::{extract_identifier, MediaSource, Page};
use crate::state::{ItemStatus, ItemStore, SyncRunStats, TrackedItem};
use crate::update::UpdateApi;

pub use self::error::SyncError;

/// Run settings derived from the application config.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Records requested per listing call.
    pub page_size: u64,
    /// Upper bound on identifiers ingested per run; 0 means unlimited.
    pub max_amount: u64,
    /// Delay between consecutive update requests.
    pub throttle: Duration,
    /// Go straight to the update phase without contacting MediaHaven.
    pub skip_discovery: bool,
    /// JSON pointer to the identifier inside a listing record.
    pub identifier_pointer: String,
    pub no_progress_bar: bool,
}

/// Outcome of a completed (or stopped) run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Items newly inserted during discovery.
    pub discovered: u64,
    /// Listing records without a usable identifier.
    pub skipped: u64,
    pub updated: u64,
    pub failed: u64,
    /// A stop cut the run short of its work.
    pub interrupted: bool,
}

pub struct Synchronizer {
    source: Arc<dyn MediaSource>,
    updater: Arc<dyn UpdateApi>,
    store: Arc<dyn ItemStore>,
    config: SyncConfig,
}

impl Synchronizer {
    pub fn new(
        source: Arc<dyn MediaSource>,
        updater: Arc<dyn UpdateApi>,
        store: Arc<dyn ItemStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            updater,
            store,
            config,
        }
    }

    /// Run discovery then update, recording the run in the store history.
    ///
    /// `shutdown_token` is checked between pages and between items, after
    /// the throttle pause; work already in flight always completes.
    pub async fn run(&self, shutdown_token: CancellationToken) -> Result<RunReport, SyncError> {
        let started = Instant::now();
        let run_id = self.store.start_sync_run().await?;
        let mut report = RunReport::default();

        let result = async {
            self.discover(&shutdown_token, &mut report).await?;
            self.update(&shutdown_token, &mut report).await
        }
        .await;

        let stats = SyncRunStats {
            discovered: report.discovered,
            updated: report.updated,
            failed: report.failed,
            interrupted: report.interrupted,
        };
        if let Err(e) = self.store.complete_sync_run(run_id, &stats).await {
            tracing::warn!(run_id, error = %e, "Failed to record sync run");
        }
        result?;

        tracing::info!("── Summary ──");
        tracing::info!(
            "  {} discovered, {} skipped, {} updated, {} failed",
            report.discovered,
            report.skipped,
            report.updated,
            report.failed
        );
        if report.interrupted {
            tracing::info!("  stopped early, remaining items are picked up by the next run");
        }
        tracing::info!("  elapsed: {}", format_duration(started.elapsed()));

        Ok(report)
    }

    async fn discover(
        &self,
        shutdown_token: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<(), SyncError> {
        if self.config.skip_discovery {
            tracing::info!("Discovery disabled, updating known items only");
            return Ok(());
        }

        let page_size = self.config.page_size;
        let mut page = match self.source.get_page(0, page_size).await {
            Ok(page) => page,
            Err(e) if e.is_auth() => return Err(SyncError::Auth(e)),
            Err(e) => {
                tracing::warn!(error = %e, "Could not list MediaHaven items, skipping discovery");
                return Ok(());
            }
        };

        let known = self.store.count_all().await?;
        if known == page.total_count {
            tracing::info!(
                "Store already holds all {} items, skipping discovery",
                known
            );
            return Ok(());
        }
        tracing::info!(
            total = page.total_count,
            known,
            "Discovering MediaHaven items"
        );

        let limit = match self.config.max_amount {
            0 => u64::MAX,
            n => n,
        };
        // Shrinks by one for every record without an identifier.
        let mut target = page.total_count;
        let mut seen = 0u64;
        let mut offset = 0u64;

        loop {
            if page.records.is_empty() {
                tracing::debug!(offset, "Empty page, ending discovery");
                break;
            }
            let consumed = page.records.len() as u64;
            let batch = self.collect_batch(&page, offset, limit, &mut seen, &mut target, report);

            match self.store.insert_if_absent(&batch).await {
                Ok(inserted) => {
                    report.discovered += inserted;
                    tracing::debug!(offset, inserted, "Stored page");
                }
                Err(e) => tracing::warn!(
                    offset,
                    count = batch.len(),
                    error = %e,
                    "Failed to store page, its items are not tracked in this run"
                ),
            }

            offset += consumed;
            if seen >= target.min(limit) {
                break;
            }
            if shutdown_token.is_cancelled() {
                tracing::info!("Stop requested, ending discovery");
                report.interrupted = true;
                break;
            }

            page = match self.source.get_page(offset, page_size).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(offset, error = %e, "Failed to fetch page, ending discovery early");
                    break;
                }
            };
        }

        tracing::info!(
            discovered = report.discovered,
            skipped = report.skipped,
            "Discovery finished"
        );
        Ok(())
    }

    /// Turn one page into pending items, stopping at `limit` identifiers.
    fn collect_batch(
        &self,
        page: &Page,
        offset: u64,
        limit: u64,
        seen: &mut u64,
        target: &mut u64,
        report: &mut RunReport,
    ) -> Vec<TrackedItem> {
        let mut batch = Vec::with_capacity(page.records.len());
        for (i, record) in page.records.iter().enumerate() {
            if *seen >= limit {
                break;
            }
            match extract_identifier(record, &self.config.identifier_pointer) {
                Some(id) => {
                    batch.push(TrackedItem::new_pending(id));
                    *seen += 1;
                }
                None => {
                    report.skipped += 1;
                    *target = target.saturating_sub(1);
                    tracing::warn!(
                        offset = offset + i as u64,
                        pointer = %self.config.identifier_pointer,
                        "Record has no identifier, skipping"
                    );
                }
            }
        }
        batch
    }

    async fn update(
        &self,
        shutdown_token: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<(), SyncError> {
        let items = self
            .store
            .find_by_status_not(ItemStatus::UpdateSucceeded)
            .await?;
        if items.is_empty() {
            tracing::info!("No items awaiting an update");
            return Ok(());
        }
        tracing::info!("Requesting updates for {} items", items.len());

        let pb = create_progress_bar(self.config.no_progress_bar, items.len() as u64);
        for (i, item) in items.iter().enumerate() {
            if i > 0 && !self.config.throttle.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.throttle) => {}
                    _ = shutdown_token.cancelled() => {}
                }
            }
            if shutdown_token.is_cancelled() {
                pb.suspend(|| tracing::info!("Stop requested, leaving remaining items for the next run"));
                report.interrupted = true;
                break;
            }

            let accepted = self.updater.request_update(item.external_id.trim()).await;
            let status = if accepted {
                report.updated += 1;
                ItemStatus::UpdateSucceeded
            } else {
                report.failed += 1;
                ItemStatus::UpdateFailed
            };

            if let Err(e) = self
                .store
                .update_status(&item.external_id, status, Utc::now())
                .await
            {
                pb.suspend(|| {
                    tracing::warn!(
                        external_id = %item.external_id,
                        %status,
                        error = %e,
                        "Failed to record update outcome"
                    )
                });
            }
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(())
    }
}

/// Create a progress bar with a consistent template.
///
/// Hidden when `--no-progress-bar` was passed or stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .expect("valid template")
        .progress_chars("=> "),
    );
    pb
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
