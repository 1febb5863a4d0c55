//! Migration runs.
//!
//! A [`TransferOrchestrator`] owns the ledger and drives one source into the
//! destination: enumerate a page, check each item, upload what is missing,
//! record every outcome, persist once per page. Per-item failures are
//! recorded and the run moves on; listing and authentication failures end
//! the run after the ledger has been flushed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use skyferry_common::{sanitize_component, Error, Origin, RemotePath, Result, SourceFile};
use skyferry_storage::{DestinationProvider, HierarchyLookup, SourceProvider};

use crate::config::TransferConfig;
use crate::enumerator::SourceEnumerator;
use crate::existence::ExistenceChecker;
use crate::ledger::{LedgerSnapshot, TransferLedger, TransferRecord};
use crate::path::DestinationPathResolver;
use crate::retry::RetryExecutor;
use crate::upload::UploadEngine;

/// How the items of one page are processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// One item at a time, in listing order.
    Sequential,
    /// Every item of a page as its own task, bounded by `max_concurrency`.
    Concurrent,
}

impl ProcessingMode {
    /// Default mode for a source.
    pub fn for_origin(origin: Origin) -> Self {
        match origin {
            Origin::GoogleDrive => ProcessingMode::Sequential,
            Origin::GooglePhotos => ProcessingMode::Concurrent,
        }
    }
}

/// What happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Uploaded in this run.
    Uploaded,
    /// Already at the destination.
    Skipped,
    /// The transfer failed; the record carries the error.
    Failed,
}

/// Result of processing one item, applied to the ledger by the run owner.
#[derive(Debug, Clone)]
pub struct ItemReport {
    /// What happened.
    pub outcome: ItemOutcome,
    /// Ledger record to apply.
    pub record: TransferRecord,
    /// Whether the source copy was deleted.
    pub source_deleted: bool,
}

/// Summary of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Identifier carried by every log line of the run.
    pub run_id: Uuid,
    /// Source that was migrated.
    pub origin: Origin,
    /// Listing pages processed.
    pub pages: usize,
    /// Items uploaded.
    pub uploaded: usize,
    /// Items already present.
    pub skipped: usize,
    /// Items that failed.
    pub failed: usize,
    /// Source copies deleted.
    pub deleted: usize,
    /// Times the ledger was written to disk.
    pub ledger_writes: usize,
    /// Whether the run stopped on cancellation.
    pub cancelled: bool,
    /// Wall time of the run.
    pub duration: Duration,
}

impl RunReport {
    fn new(origin: Origin) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            origin,
            pages: 0,
            uploaded: 0,
            skipped: 0,
            failed: 0,
            deleted: 0,
            ledger_writes: 0,
            cancelled: false,
            duration: Duration::ZERO,
        }
    }

    /// Items that reached a conclusion.
    pub fn processed(&self) -> usize {
        self.uploaded + self.skipped + self.failed
    }
}

/// Where the items of a source land, relative to the base folder.
enum FolderPlan {
    /// Mirror the source folder hierarchy.
    Hierarchy(DestinationPathResolver),
    /// Put everything in one folder.
    Fixed(RemotePath),
}

impl FolderPlan {
    async fn folder_for(&self, file: &SourceFile) -> Result<RemotePath> {
        match self {
            FolderPlan::Hierarchy(resolver) => {
                resolver.resolve_from_parent(file.primary_parent()).await
            }
            FolderPlan::Fixed(path) => Ok(path.clone()),
        }
    }
}

/// Per-item work, shared by every task of a run.
struct ItemPipeline {
    source: Arc<dyn SourceProvider>,
    folders: FolderPlan,
    checker: ExistenceChecker,
    uploader: UploadEngine,
    base: RemotePath,
    retry: RetryExecutor,
    delete_after_transfer: bool,
    owner_email: Option<String>,
}

impl ItemPipeline {
    /// Take one item to a conclusion.
    ///
    /// Only authentication errors are returned; everything else becomes a
    /// failed record. An item that failed before its folder was known is
    /// recorded under [`RemotePath::unresolved`].
    async fn process(&self, file: &SourceFile, uploaded: &LedgerSnapshot) -> Result<ItemReport> {
        let filename = sanitize_component(&file.name);
        let mut resolved = None;

        match self.transfer(file, &filename, uploaded, &mut resolved).await {
            Ok(report) => Ok(report),
            Err(e) if e.is_authentication() => Err(e),
            Err(e) => {
                let destination = resolved.unwrap_or_else(|| RemotePath::unresolved(&file.id));
                error!("Transfer of {} to {} failed: {}", file.id, destination, e);
                Ok(self.failed(file, destination, e.to_string()))
            }
        }
    }

    fn failed(&self, file: &SourceFile, destination: RemotePath, error: String) -> ItemReport {
        ItemReport {
            outcome: ItemOutcome::Failed,
            record: TransferRecord::failed(
                destination,
                file.id.clone(),
                self.source.origin(),
                error,
            ),
            source_deleted: false,
        }
    }

    async fn transfer(
        &self,
        file: &SourceFile,
        filename: &str,
        uploaded: &LedgerSnapshot,
        resolved: &mut Option<RemotePath>,
    ) -> Result<ItemReport> {
        let origin = self.source.origin();
        let folder = self.folders.folder_for(file).await?;
        let destination = folder.join(filename)?;
        *resolved = Some(destination.clone());

        if self.checker.exists(filename, &folder, uploaded).await? {
            debug!("{} already at destination, skipping", destination);
            let source_deleted = self.delete_if_owned(file).await?;
            return Ok(ItemReport {
                outcome: ItemOutcome::Skipped,
                record: TransferRecord::succeeded(destination.clone(), file.id.clone(), origin),
                source_deleted,
            });
        }

        let size = match file.size {
            Some(size) => Some(size),
            None => match self.source.content_length(file).await {
                Ok(size) => size,
                Err(e) if e.is_authentication() => return Err(e),
                Err(e) => {
                    warn!("Size of {} unknown: {}", file.id, e);
                    None
                }
            },
        };

        let stream = self
            .retry
            .execute(|| self.source.download_stream(file))
            .await?;

        let target = self.base.concat(&folder);
        let progress = |sent: u64| debug!("{}: {} bytes sent", filename, sent);
        let item = self
            .uploader
            .upload(stream, filename, &target, size, Some(&progress))
            .await?;
        info!("Uploaded {} as {} ({} bytes)", file.id, destination, item.size.unwrap_or_default());

        let source_deleted = self.delete_if_owned(file).await?;
        Ok(ItemReport {
            outcome: ItemOutcome::Uploaded,
            record: TransferRecord::succeeded(destination, file.id.clone(), origin),
            source_deleted,
        })
    }

    /// Delete the source copy when enabled and the configured owner owns it.
    ///
    /// A refused delete is logged; the transfer itself still counts.
    async fn delete_if_owned(&self, file: &SourceFile) -> Result<bool> {
        if !self.delete_after_transfer {
            return Ok(false);
        }
        let Some(owner) = self.owner_email.as_deref() else {
            return Ok(false);
        };
        if !file.is_owned_by(owner) {
            debug!("Keeping {}: not owned by {}", file.id, owner);
            return Ok(false);
        }

        match self.source.delete(&file.id).await {
            Ok(()) => {
                info!("Deleted source copy of {}", file.id);
                Ok(true)
            }
            Err(e) if e.is_authentication() => Err(e),
            Err(e) => {
                warn!("Could not delete source copy of {}: {}", file.id, e);
                Ok(false)
            }
        }
    }
}

/// Drives migration runs for one source.
pub struct TransferOrchestrator {
    source: Arc<dyn SourceProvider>,
    pipeline: Arc<ItemPipeline>,
    ledger: TransferLedger,
    mode: ProcessingMode,
    page_size: u32,
    max_concurrency: usize,
    retry: RetryExecutor,
}

impl TransferOrchestrator {
    /// Create an orchestrator.
    ///
    /// Drive sources need `hierarchy` to mirror their folders; photo
    /// libraries go into the configured photos folder.
    ///
    /// # Errors
    /// - `InvalidInput` for an invalid config or a Drive source without
    ///   hierarchy access
    pub fn new(
        source: Arc<dyn SourceProvider>,
        destination: Arc<dyn DestinationProvider>,
        hierarchy: Option<Arc<dyn HierarchyLookup>>,
        ledger: TransferLedger,
        config: &TransferConfig,
        owner_email: Option<String>,
    ) -> Result<Self> {
        config.validate()?;
        let origin = source.origin();

        let (folders, page_size) = match origin {
            Origin::GoogleDrive => {
                let lookup = hierarchy.ok_or_else(|| {
                    Error::InvalidInput("Drive migration needs folder lookups".to_string())
                })?;
                (
                    FolderPlan::Hierarchy(DestinationPathResolver::new(
                        lookup,
                        config.root_sentinel.clone(),
                    )),
                    config.drive_page_size,
                )
            }
            Origin::GooglePhotos => (
                FolderPlan::Fixed(config.photos_path()?),
                config.photos_page_size,
            ),
        };

        if config.delete_after_transfer && owner_email.is_none() {
            warn!("Source deletion is enabled but no owner is known; nothing will be deleted");
        }

        let retry = RetryExecutor::new(config.retry.clone());
        let pipeline = ItemPipeline {
            source: source.clone(),
            folders,
            checker: ExistenceChecker::new(destination.clone(), config.base_folder.clone()),
            uploader: UploadEngine::new(destination, config.chunk_units),
            base: config.base_path()?,
            retry: retry.clone(),
            delete_after_transfer: config.delete_after_transfer,
            owner_email,
        };

        Ok(Self {
            source,
            pipeline: Arc::new(pipeline),
            ledger,
            mode: ProcessingMode::for_origin(origin),
            page_size,
            max_concurrency: config.max_concurrency,
            retry,
        })
    }

    /// Override how page items are processed.
    pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
        self.mode = mode;
        self
    }

    /// The ledger as it stands.
    pub fn ledger(&self) -> &TransferLedger {
        &self.ledger
    }

    /// Give the ledger back.
    pub fn into_ledger(self) -> TransferLedger {
        self.ledger
    }

    /// Migrate every item the source lists.
    ///
    /// Cancellation is checked between pages; the page in flight completes.
    ///
    /// # Errors
    /// - Authentication errors
    /// - `Enumeration` if listing fails after retries
    /// - Ledger persistence errors
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunReport> {
        let report = RunReport::new(self.source.origin());
        let span = info_span!("run", run_id = %report.run_id, origin = %report.origin);
        self.run_pages(report, cancel).instrument(span).await
    }

    async fn run_pages(
        &mut self,
        mut report: RunReport,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let mut pages = SourceEnumerator::new(self.source.clone(), self.page_size, self.retry.clone());
        info!(
            "Starting {} migration ({} already uploaded)",
            report.origin,
            self.ledger.succeeded_count()
        );

        loop {
            if cancel.is_cancelled() {
                info!("Cancelled; no further pages will be fetched");
                report.cancelled = true;
                break;
            }

            let files = match pages.next_page().await {
                Ok(Some(files)) => files,
                Ok(None) => break,
                Err(e) => {
                    self.flush_before_abort().await;
                    return Err(e);
                }
            };

            report.pages += 1;
            let settled = self.process_page(files, &mut report).await;
            self.save(&mut report).await?;
            settled?;

            info!(
                "Page {} done: {} uploaded, {} skipped, {} failed so far",
                report.pages, report.uploaded, report.skipped, report.failed
            );
        }

        self.save(&mut report).await?;
        report.duration = started.elapsed();
        info!(
            "Finished {} migration: {} uploaded, {} skipped, {} failed in {:?}",
            report.origin, report.uploaded, report.skipped, report.failed, report.duration
        );
        Ok(report)
    }

    /// Process every record in the failed ledger for this source again.
    ///
    /// Items are fetched by ID; a success moves the path to the succeeded
    /// set.
    ///
    /// # Errors
    /// - Authentication errors
    /// - Ledger persistence errors
    pub async fn retry_failed(&mut self, cancel: CancellationToken) -> Result<RunReport> {
        let report = RunReport::new(self.source.origin());
        let span = info_span!("retry", run_id = %report.run_id, origin = %report.origin);
        self.retry_records(report, cancel).instrument(span).await
    }

    async fn retry_records(
        &mut self,
        mut report: RunReport,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let records = self.ledger.failed_records(Some(report.origin));
        info!("Retrying {} failed items", records.len());

        for batch in records.chunks(self.page_size.max(1) as usize) {
            if cancel.is_cancelled() {
                info!("Cancelled; remaining failed items stay recorded");
                report.cancelled = true;
                break;
            }

            report.pages += 1;
            let settled = self.retry_batch(batch, &mut report).await;
            self.save(&mut report).await?;
            settled?;
        }

        self.save(&mut report).await?;
        report.duration = started.elapsed();
        info!(
            "Retry finished: {} uploaded, {} skipped, {} still failing",
            report.uploaded, report.skipped, report.failed
        );
        Ok(report)
    }

    async fn retry_batch(&mut self, batch: &[TransferRecord], report: &mut RunReport) -> Result<()> {
        let snapshot = self.ledger.snapshot();
        for previous in batch {
            let file = match self.source.get_file(&previous.source_file_id).await {
                Ok(file) => file,
                Err(e) if e.is_authentication() => return Err(e),
                Err(e) => {
                    warn!(
                        "Cannot fetch {} for {}: {}",
                        previous.source_file_id, previous.destination_path, e
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let item = self.pipeline.process(&file, &snapshot).await?;
            if item.outcome != ItemOutcome::Failed
                || item.record.destination_path != previous.destination_path
            {
                // The item may resolve to a new path if it moved at the source
                self.ledger.clear_failure(&previous.destination_path);
            }
            self.apply(item, report);
        }
        Ok(())
    }

    async fn process_page(&mut self, files: Vec<SourceFile>, report: &mut RunReport) -> Result<()> {
        let snapshot = self.ledger.snapshot();
        debug!("Processing {} items", files.len());

        match self.mode {
            ProcessingMode::Sequential => {
                for file in &files {
                    let item = self.pipeline.process(file, &snapshot).await?;
                    self.apply(item, report);
                }
                Ok(())
            }
            ProcessingMode::Concurrent => {
                let permits = Arc::new(Semaphore::new(self.max_concurrency));
                let mut tasks = JoinSet::new();
                let mut in_flight = HashMap::new();
                for file in files {
                    let pipeline = self.pipeline.clone();
                    let snapshot = snapshot.clone();
                    let permits = permits.clone();
                    let item = file.clone();
                    let handle = tasks.spawn(async move {
                        let _permit = permits
                            .acquire_owned()
                            .await
                            .map_err(|e| Error::Storage(e.to_string()))?;
                        pipeline.process(&item, &snapshot).await
                    });
                    in_flight.insert(handle.id(), file);
                }

                // Every task settles before the page is persisted
                let mut first_error = None;
                while let Some(joined) = tasks.join_next_with_id().await {
                    match joined {
                        Ok((id, Ok(item))) => {
                            in_flight.remove(&id);
                            self.apply(item, report);
                        }
                        Ok((id, Err(e))) => {
                            in_flight.remove(&id);
                            first_error.get_or_insert(e);
                        }
                        Err(e) => match in_flight.remove(&e.id()) {
                            Some(file) => {
                                error!("Task for {} ended abnormally: {}", file.id, e);
                                let item = self.pipeline.failed(
                                    &file,
                                    RemotePath::unresolved(&file.id),
                                    format!("Task ended abnormally: {}", e),
                                );
                                self.apply(item, report);
                            }
                            None => error!("Item task ended abnormally: {}", e),
                        },
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }

    fn apply(&mut self, item: ItemReport, report: &mut RunReport) {
        match item.outcome {
            ItemOutcome::Uploaded => report.uploaded += 1,
            ItemOutcome::Skipped => report.skipped += 1,
            ItemOutcome::Failed => report.failed += 1,
        }
        if item.source_deleted {
            report.deleted += 1;
        }
        self.ledger.apply(item.record);
    }

    async fn save(&mut self, report: &mut RunReport) -> Result<()> {
        if self.ledger.persist().await? {
            report.ledger_writes += 1;
        }
        Ok(())
    }

    async fn flush_before_abort(&mut self) {
        if let Err(e) = self.ledger.persist().await {
            error!("Could not persist ledger before stopping: {}", e);
        }
    }
}
