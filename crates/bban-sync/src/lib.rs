//! Cycle orchestration: fetch, sync, match, notify on a fixed cadence.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bban_core::{Catalog, OfficeEntry, ServiceEntry};
use bban_notify::{
    notify_matches, DeliveryReport, PreferenceIndex, PushConfig, PushTransport, WebPushTransport,
};
use bban_snapshot::{candidates_from_snapshot, parse_snapshot};
use bban_storage::{AppointmentStore, SqlitePool, SubscriptionStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bban-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub snapshot_path: PathBuf,
    pub catalog_path: PathBuf,
    /// External fetcher invocation; unset means the snapshot file is
    /// produced out of band.
    pub fetch_command: Option<String>,
    pub vapid_private_key: PathBuf,
    pub vapid_subject: String,
    pub push_ttl_secs: u32,
    pub cycle_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://bban.db?mode=rwc".to_string()),
            snapshot_path: std::env::var("SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("appointments.json")),
            catalog_path: std::env::var("CATALOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("catalog.yaml")),
            fetch_command: std::env::var("FETCH_COMMAND")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            vapid_private_key: std::env::var("VAPID_PRIVATE_KEY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("private_key.pem")),
            vapid_subject: std::env::var("VAPID_SUBJECT")
                .unwrap_or_else(|_| "mailto:ops@example.org".to_string()),
            push_ttl_secs: std::env::var("PUSH_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
            cycle_cron: std::env::var("CYCLE_CRON").unwrap_or_else(|_| "0 * * * * *".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    services: Vec<ServiceEntry>,
    offices: Vec<OfficeEntry>,
}

pub fn load_catalog(path: impl AsRef<Path>) -> Result<Catalog> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: CatalogFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let catalog = Catalog::new(file.services, file.offices)
        .with_context(|| format!("validating {}", path.display()))?;
    info!(
        services = catalog.services().len(),
        offices = catalog.offices().len(),
        "catalog loaded"
    );
    Ok(catalog)
}

/// Produces a fresh snapshot before each sync. Ok means a current snapshot
/// file should exist at the configured path.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self) -> Result<()>;
}

/// Spawns the configured fetcher process; pass/fail is its exit status.
pub struct CommandFetcher {
    program: String,
    args: Vec<String>,
}

impl CommandFetcher {
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl SnapshotFetcher for CommandFetcher {
    async fn fetch(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .status()
            .await
            .with_context(|| format!("spawning fetcher {}", self.program))?;
        if !status.success() {
            bail!("fetcher {} exited with {status}", self.program);
        }
        Ok(())
    }
}

/// No-op fetcher for deployments where another process writes the snapshot.
pub struct ExternalSnapshot;

#[async_trait]
impl SnapshotFetcher for ExternalSnapshot {
    async fn fetch(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CycleStatus {
    Completed,
    FetchFailed,
    SnapshotMissing,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: CycleStatus,
    pub candidates: usize,
    pub inserted: usize,
    pub delivery: DeliveryReport,
}

fn summary(
    run_id: Uuid,
    started_at: DateTime<Utc>,
    status: CycleStatus,
    candidates: usize,
    inserted: usize,
    delivery: DeliveryReport,
) -> CycleSummary {
    CycleSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        status,
        candidates,
        inserted,
        delivery,
    }
}

/// One tick of the pipeline: FETCH, then store + match + notify.
///
/// Holds no mutable state across ticks; everything a cycle touches lives in
/// the database, so an aborted tick leaves nothing for the next one to trip
/// over.
pub struct CycleRunner {
    catalog: Catalog,
    pool: SqlitePool,
    snapshot_path: PathBuf,
    fetcher: Box<dyn SnapshotFetcher>,
    transport: Arc<dyn PushTransport>,
}

impl CycleRunner {
    pub fn new(
        catalog: Catalog,
        pool: SqlitePool,
        snapshot_path: PathBuf,
        fetcher: Box<dyn SnapshotFetcher>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        Self {
            catalog,
            pool,
            snapshot_path,
            fetcher,
            transport,
        }
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let catalog = load_catalog(&config.catalog_path)?;
        let pool = bban_storage::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        bban_storage::ensure_schema(&pool)
            .await
            .context("preparing database schema")?;

        let fetcher: Box<dyn SnapshotFetcher> = match &config.fetch_command {
            Some(line) => Box::new(
                CommandFetcher::parse(line).context("FETCH_COMMAND is set but empty")?,
            ),
            None => Box::new(ExternalSnapshot),
        };

        let transport = WebPushTransport::new(PushConfig {
            vapid_private_key: config.vapid_private_key.clone(),
            vapid_subject: config.vapid_subject.clone(),
            ttl_secs: config.push_ttl_secs,
        })
        .context("initializing web push transport")?;

        Ok(Self::new(
            catalog,
            pool,
            config.snapshot_path.clone(),
            fetcher,
            Arc::new(transport),
        ))
    }

    /// Runs one full cycle. Fetch failures and a missing snapshot skip the
    /// sync stage and still return Ok; parse and store errors propagate so
    /// the caller can log them, and the next tick proceeds regardless.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "cycle started");

        if let Err(err) = self.fetcher.fetch().await {
            warn!(%run_id, error = %err, "fetch failed, skipping sync for this tick");
            return Ok(summary(
                run_id,
                started_at,
                CycleStatus::FetchFailed,
                0,
                0,
                DeliveryReport::default(),
            ));
        }

        let text = match tokio::fs::read_to_string(&self.snapshot_path).await {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    %run_id,
                    path = %self.snapshot_path.display(),
                    error = %err,
                    "snapshot unreadable, skipping sync for this tick"
                );
                return Ok(summary(
                    run_id,
                    started_at,
                    CycleStatus::SnapshotMissing,
                    0,
                    0,
                    DeliveryReport::default(),
                ));
            }
        };

        let doc = parse_snapshot(&text).context("parsing snapshot document")?;
        let candidates = candidates_from_snapshot(&doc, &self.catalog);

        let appointments = AppointmentStore::new(self.pool.clone());
        let inserted = appointments
            .insert_new(&candidates)
            .await
            .context("committing appointment batch")?;

        let delivery = if inserted.is_empty() {
            info!(%run_id, candidates = candidates.len(), "no new appointments");
            DeliveryReport::default()
        } else {
            let subscriptions = SubscriptionStore::new(self.pool.clone());
            let all = subscriptions
                .list_all()
                .await
                .context("loading subscriptions")?;
            let index = PreferenceIndex::build(all);
            notify_matches(
                &self.catalog,
                &index,
                &inserted,
                self.transport.as_ref(),
                &subscriptions,
            )
            .await
        };

        let summary = summary(
            run_id,
            started_at,
            CycleStatus::Completed,
            candidates.len(),
            inserted.len(),
            delivery,
        );
        info!(
            %run_id,
            candidates = summary.candidates,
            inserted = summary.inserted,
            sent = summary.delivery.sent,
            gone_removed = summary.delivery.gone_removed,
            failed = summary.delivery.failed,
            "cycle completed"
        );
        Ok(summary)
    }

    /// `run_cycle` for callers that must outlive a bad tick: parse and store
    /// errors are logged here and the next tick proceeds as usual.
    pub async fn run_cycle_logged(&self) -> Option<CycleSummary> {
        match self.run_cycle().await {
            Ok(summary) => Some(summary),
            Err(err) => {
                error!(error = %err, "cycle failed");
                None
            }
        }
    }
}

/// Schedules `run_cycle` on the configured cron. Ticks are strictly
/// serialized: if the previous cycle is still running when the next tick
/// fires, that tick is skipped rather than overlapped.
pub async fn build_scheduler(runner: Arc<CycleRunner>, cron: &str) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let busy = Arc::new(tokio::sync::Mutex::new(()));

    let job = Job::new_async(cron, move |_uuid, _lock| {
        let runner = runner.clone();
        let busy = busy.clone();
        Box::pin(async move {
            let Ok(_guard) = busy.try_lock() else {
                warn!("previous cycle still running, skipping this tick");
                return;
            };
            runner.run_cycle_logged().await;
        })
    })
    .with_context(|| format!("creating cycle job for cron {cron}"))?;

    scheduler.add(job).await.context("adding cycle job")?;
    Ok(scheduler)
}
