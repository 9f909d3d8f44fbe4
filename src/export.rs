//! Contribution-session export.
//!
//! One export job, in order: take the session's lock, create a staging
//! tree, list the accepted contributions, download them concurrently into
//! the tree, zip the tree, upload the archive and record its key on the
//! session. The staging tree, the archive and the lock are released on every
//! exit path.
//!
//! A contribution whose download fails is logged, reported in
//! [`ExportReport::skipped`] and left out of the archive; the export goes on
//! with the rest.

use crate::archive::build_archive;
use crate::context::JobContext;
use crate::error::JobError;
use crate::lock::{LockHandle, LockManager, LockOptions};
use crate::message::{Message, Topic};
use crate::services::{ArticleService, Contribution, ContributionService, ObjectStore, SessionService};
use crate::staging::{article_file_name, image_file_name, StagingTree};
use crate::worker::JobHandler;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const EXPORT_LOCK_TTL: Duration = Duration::from_secs(60 * 60);
pub const EXPORT_LOCK_TRIES: u32 = 2;
pub const DEFAULT_EXPORT_CONCURRENCY: usize = 8;

/// Upper bound on the unlock call, which runs after the job deadline may have passed.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock key guarding the exports of one session.
pub fn lock_key(session_id: i64) -> String {
    format!("session:{}:export-asset-lock", session_id)
}

#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub lock: LockOptions,
    /// Maximum concurrent contribution downloads.
    pub concurrency: usize,
    /// Parent directory of staging trees and archives.
    pub staging_dir: PathBuf,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            lock: LockOptions::new(EXPORT_LOCK_TTL, EXPORT_LOCK_TRIES),
            concurrency: DEFAULT_EXPORT_CONCURRENCY,
            staging_dir: std::env::temp_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedContribution {
    pub contribution_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub session_id: i64,
    /// Contributions present in the archive, by id.
    pub exported: Vec<i64>,
    pub skipped: Vec<SkippedContribution>,
    /// Storage key of the uploaded archive; `None` when there was nothing to export.
    pub asset_key: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExportReport {
    fn new(session_id: i64) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            exported: Vec::new(),
            skipped: Vec::new(),
            asset_key: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.finished_at
            .signed_duration_since(self.started_at)
            .num_milliseconds()
    }
}

/// Downloads one contribution into its staging directory.
#[derive(Clone)]
struct ContributionFetcher {
    articles: Arc<dyn ArticleService>,
    store: Arc<dyn ObjectStore>,
}

impl ContributionFetcher {
    /// Creates `dir` and fills it with the contribution's article and images.
    ///
    /// If anything fails after the directory is created, it is removed
    /// again; a directory this call did not create is never touched.
    async fn download(&self, ctx: &JobContext, dir: &Path, contribution: &Contribution) -> Result<(), JobError> {
        let article_id = contribution.article_id.ok_or_else(|| {
            JobError::InvalidEntry(format!("contribution {} has no article", contribution.id))
        })?;
        let version = ctx
            .run(self.articles.get_latest_version_of_article(article_id))
            .await?;

        ctx.run(tokio::fs::create_dir(dir)).await?;

        let result = self.fill(ctx, dir, &version.link_original, contribution).await;
        if result.is_err() {
            discard_partial(dir).await;
        }
        result
    }

    async fn fill(
        &self,
        ctx: &JobContext,
        dir: &Path,
        link_original: &str,
        contribution: &Contribution,
    ) -> Result<(), JobError> {
        let article_path = dir.join(article_file_name(link_original));
        self.fetch_to(ctx, link_original, &article_path).await?;

        for image in &contribution.images {
            let image_path = dir.join(image_file_name(&image.key)?);
            self.fetch_to(ctx, &image.key, &image_path).await?;
        }

        Ok(())
    }

    /// Streams `key` into `dest`, which must not exist yet.
    async fn fetch_to(&self, ctx: &JobContext, key: &str, dest: &Path) -> Result<(), JobError> {
        let mut reader = ctx.run(self.store.get_file(key)).await?;
        let mut file = ctx
            .run(
                tokio::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(dest),
            )
            .await
            .map_err(|e| match e {
                JobError::Io(io) if io.kind() == std::io::ErrorKind::AlreadyExists => {
                    JobError::InvalidEntry(format!("{} collides with another file", dest.display()))
                }
                other => other,
            })?;
        let bytes = ctx.run(tokio::io::copy(&mut reader, &mut file)).await?;
        ctx.run(file.flush()).await?;

        debug!(key = %key, bytes, dest = %dest.display(), "Fetched object");
        Ok(())
    }
}

/// Handler for `export-contribute-session` messages.
pub struct SessionExporter {
    contributions: Arc<dyn ContributionService>,
    sessions: Arc<dyn SessionService>,
    store: Arc<dyn ObjectStore>,
    locks: Arc<dyn LockManager>,
    fetcher: ContributionFetcher,
    settings: ExportSettings,
}

impl SessionExporter {
    pub fn new(
        contributions: Arc<dyn ContributionService>,
        articles: Arc<dyn ArticleService>,
        store: Arc<dyn ObjectStore>,
        sessions: Arc<dyn SessionService>,
        locks: Arc<dyn LockManager>,
        settings: ExportSettings,
    ) -> Self {
        Self {
            contributions,
            sessions,
            fetcher: ContributionFetcher {
                articles,
                store: store.clone(),
            },
            store,
            locks,
            settings,
        }
    }

    /// Exports every accepted contribution of `session_id` as one archive.
    ///
    /// Takes the session's export lock, downloads the contributions into a
    /// fresh staging tree, zips the tree, uploads the archive and records
    /// its key as the session's exported asset. The staging tree, the
    /// archive and the lock are released whether or not the export succeeds.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Deadline and cancellation every download and upload runs under
    /// * `session_id` - The contribute session to export
    ///
    /// # Returns
    ///
    /// The [`ExportReport`], with `asset_key` unset when the session has no
    /// accepted contributions. Fails with a lock-contention error, before
    /// touching anything, when another export of the same session is in
    /// flight; fails with [`JobError::Timeout`] when the deadline passes.
    pub async fn export(&self, ctx: &JobContext, session_id: i64) -> Result<ExportReport, JobError> {
        let key = lock_key(session_id);
        let handle = ctx.run(self.locks.acquire(&key, self.settings.lock)).await?;
        info!(session_id, key = %key, "Acquired export lock");

        let result = self.export_locked(ctx, session_id).await;

        self.release(handle).await;
        result
    }

    async fn export_locked(&self, ctx: &JobContext, session_id: i64) -> Result<ExportReport, JobError> {
        let staging = StagingTree::create(&self.settings.staging_dir)?;
        let mut report = ExportReport::new(session_id);

        let result = self.export_staged(ctx, &staging, &mut report).await;

        staging.remove();
        report.finished_at = Utc::now();
        result.map(|()| report)
    }

    async fn export_staged(
        &self,
        ctx: &JobContext,
        staging: &StagingTree,
        report: &mut ExportReport,
    ) -> Result<(), JobError> {
        let session_id = report.session_id;
        let contributions = ctx
            .run(self.contributions.get_all_accepted_contributions(session_id))
            .await?;

        if contributions.is_empty() {
            info!(session_id, "Contribute session has no accepted contributions");
            return Ok(());
        }
        info!(session_id, count = contributions.len(), "Found accepted contributions");

        self.download_all(ctx, staging, contributions, report).await;
        ctx.check()?;

        if !report.skipped.is_empty() {
            let skipped: Vec<i64> = report.skipped.iter().map(|s| s.contribution_id).collect();
            warn!(session_id, skipped = ?skipped, "Export is missing contributions");
        }

        let archive = self.archive(ctx, staging).await?;
        let file = tokio::fs::File::from_std(archive.reopen()?);
        let uploaded = ctx
            .run(self.store.upload_contribution(file, session_id))
            .await;
        discard_archive(archive);
        let uploaded = uploaded?;
        info!(session_id, key = %uploaded.key, "Uploaded export archive");

        ctx.run(self.sessions.update_exported_asset(session_id, &uploaded.key))
            .await?;
        report.asset_key = Some(uploaded.key);
        Ok(())
    }

    /// Downloads every contribution, at most `concurrency` at a time, and
    /// waits for all of them before returning.
    async fn download_all(
        &self,
        ctx: &JobContext,
        staging: &StagingTree,
        contributions: Vec<Contribution>,
        report: &mut ExportReport,
    ) {
        let slots = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut seen = HashSet::new();

        for contribution in contributions {
            if !seen.insert(contribution.id) {
                warn!(contribution_id = contribution.id, "Duplicate contribution in manifest");
                continue;
            }
            let slots = slots.clone();
            let fetcher = self.fetcher.clone();
            let ctx = ctx.clone();
            let dir = staging.contribution_dir(contribution.id);

            tasks.spawn(async move {
                let id = contribution.id;
                let permit = ctx
                    .run(async move { slots.acquire_owned().await.map_err(|_| JobError::Cancelled) })
                    .await;
                let result = match permit {
                    Ok(_permit) => fetcher.download(&ctx, &dir, &contribution).await,
                    Err(e) => Err(e),
                };
                (id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(()))) => {
                    info!(contribution_id = id, "Finished downloading contribution");
                    report.exported.push(id);
                }
                Ok((id, Err(e))) => {
                    error!(contribution_id = id, error = %e, "Download contribution failed");
                    report.skipped.push(SkippedContribution {
                        contribution_id: id,
                        reason: e.to_string(),
                    });
                }
                Err(e) => error!(error = %e, "Download task aborted"),
            }
        }

        report.exported.sort_unstable();
        report.skipped.sort_by_key(|s| s.contribution_id);
    }

    async fn archive(&self, ctx: &JobContext, staging: &StagingTree) -> Result<NamedTempFile, JobError> {
        let root = staging.path().to_path_buf();
        let parent = self.settings.staging_dir.clone();

        ctx.run(async move {
            match tokio::task::spawn_blocking(move || build_archive(&root, &parent)).await {
                Ok(result) => result,
                Err(e) => Err(JobError::Panicked(e.to_string())),
            }
        })
        .await
    }

    async fn release(&self, handle: LockHandle) {
        let key = handle.key().to_string();
        match tokio::time::timeout(RELEASE_TIMEOUT, self.locks.release(handle)).await {
            Ok(Ok(())) => debug!(key = %key, "Released export lock"),
            Ok(Err(e)) => error!(key = %key, error = %e, "Failed to unlock"),
            Err(_) => error!(key = %key, "Timed out releasing lock"),
        }
    }
}

#[async_trait]
impl JobHandler for SessionExporter {
    async fn handle(&self, ctx: &JobContext, message: &Message) -> Result<(), JobError> {
        let Message::ExportContributeSession(payload) = message else {
            return Err(JobError::UnexpectedPayload {
                expected: Topic::ExportContributeSession,
                actual: message.topic(),
            });
        };

        let report = self.export(ctx, payload.contribute_session_id).await?;
        info!(
            session_id = report.session_id,
            exported = report.exported.len(),
            skipped = report.skipped.len(),
            key = ?report.asset_key,
            duration_ms = report.duration_ms(),
            "Export finished"
        );
        Ok(())
    }
}

fn discard_archive(archive: NamedTempFile) {
    let path = archive.path().to_path_buf();
    if let Err(e) = archive.close() {
        error!(path = %path.display(), error = %e, "Failed to delete archive");
    }
}

/// Removes what a failed download left behind.
async fn discard_partial(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove partial download"),
    }
}
