//! End-to-end cycle tests over a scratch database and snapshot file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bban_core::{Catalog, OfficeEntry, ServiceEntry, Subscription};
use bban_notify::{DeliveryOutcome, NotificationPayload, PushTransport};
use bban_storage::{connect, ensure_schema, AppointmentStore, SqlitePool};
use bban_sync::{CycleRunner, CycleStatus, ExternalSnapshot, SnapshotFetcher};
use tempfile::TempDir;
use tokio::sync::Mutex;

const SNAPSHOT: &str =
    r#"{"PASSPORT": {"CityHallA": {"2024-06-01": {"appointmentTimestamps": [1717200000]}}}}"#;

fn catalog() -> Catalog {
    Catalog::new(
        vec![ServiceEntry {
            key: "PASSPORT".into(),
            id: 1,
            display_name: "Passport".into(),
        }],
        vec![
            OfficeEntry {
                key: "CityHallA".into(),
                id: 7,
                display_name: "City Hall A".into(),
            },
            OfficeEntry {
                key: "CityHallB".into(),
                id: 8,
                display_name: "City Hall B".into(),
            },
        ],
    )
    .expect("valid catalog")
}

#[derive(Default)]
struct RecordingTransport {
    outcomes: HashMap<String, DeliveryOutcome>,
    attempts: Mutex<Vec<(String, NotificationPayload)>>,
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn deliver(
        &self,
        subscription: &Subscription,
        payload: &NotificationPayload,
    ) -> DeliveryOutcome {
        self.attempts
            .lock()
            .await
            .push((subscription.endpoint.clone(), payload.clone()));
        self.outcomes
            .get(&subscription.endpoint)
            .cloned()
            .unwrap_or(DeliveryOutcome::Delivered)
    }
}

struct FailingFetcher;

#[async_trait]
impl SnapshotFetcher for FailingFetcher {
    async fn fetch(&self) -> anyhow::Result<()> {
        anyhow::bail!("fetcher crashed")
    }
}

struct Fixture {
    _dir: TempDir,
    pool: SqlitePool,
    snapshot_path: PathBuf,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("bban.db").display());
        let pool = connect(&url).await.expect("connect");
        ensure_schema(&pool).await.expect("schema");
        let snapshot_path = dir.path().join("appointments.json");
        Self {
            _dir: dir,
            pool,
            snapshot_path,
        }
    }

    async fn seed_subscription(&self, endpoint: &str, services: &str, offices: &str) {
        sqlx::query(
            "INSERT INTO subscriptions (endpoint, p256dh, auth, services, offices) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(endpoint)
        .bind("p256dh-key")
        .bind("auth-key")
        .bind(services)
        .bind(offices)
        .execute(&self.pool)
        .await
        .expect("seed subscription");
    }

    fn write_snapshot(&self, text: &str) {
        std::fs::write(&self.snapshot_path, text).expect("write snapshot");
    }

    fn runner(
        &self,
        fetcher: Box<dyn SnapshotFetcher>,
        transport: Arc<RecordingTransport>,
    ) -> CycleRunner {
        CycleRunner::new(
            catalog(),
            self.pool.clone(),
            self.snapshot_path.clone(),
            fetcher,
            transport as Arc<dyn PushTransport>,
        )
    }
}

#[tokio::test]
async fn single_cycle_stores_matches_and_notifies() {
    let fixture = Fixture::new().await;
    fixture
        .seed_subscription("https://push.example/sub", "[1]", "[]")
        .await;
    fixture.write_snapshot(SNAPSHOT);

    let transport = Arc::new(RecordingTransport::default());
    let runner = fixture.runner(Box::new(ExternalSnapshot), transport.clone());

    let summary = runner.run_cycle().await.expect("cycle");
    assert_eq!(summary.status, CycleStatus::Completed);
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.delivery.attempted, 1);
    assert_eq!(summary.delivery.sent, 1);

    let store = AppointmentStore::new(fixture.pool.clone());
    assert_eq!(store.count().await.expect("count"), 1);

    let attempts = transport.attempts.lock().await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].0, "https://push.example/sub");
    assert_eq!(attempts[0].1.title, "New Appointment Available!");
    assert!(attempts[0].1.message.starts_with("Passport at City Hall A on "));
}

#[tokio::test]
async fn second_cycle_over_same_snapshot_is_silent() {
    let fixture = Fixture::new().await;
    fixture
        .seed_subscription("https://push.example/sub", "[]", "[]")
        .await;
    fixture.write_snapshot(SNAPSHOT);

    let transport = Arc::new(RecordingTransport::default());
    let runner = fixture.runner(Box::new(ExternalSnapshot), transport.clone());

    let first = runner.run_cycle().await.expect("first cycle");
    assert_eq!(first.inserted, 1);

    let second = runner.run_cycle().await.expect("second cycle");
    assert_eq!(second.status, CycleStatus::Completed);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.delivery.attempted, 0);

    let store = AppointmentStore::new(fixture.pool.clone());
    assert_eq!(store.count().await.expect("count"), 1);
    assert_eq!(transport.attempts.lock().await.len(), 1);
}

#[tokio::test]
async fn fetch_failure_skips_sync_entirely() {
    let fixture = Fixture::new().await;
    fixture
        .seed_subscription("https://push.example/sub", "[]", "[]")
        .await;
    fixture.write_snapshot(SNAPSHOT);

    let transport = Arc::new(RecordingTransport::default());
    let runner = fixture.runner(Box::new(FailingFetcher), transport.clone());

    let summary = runner.run_cycle().await.expect("cycle");
    assert_eq!(summary.status, CycleStatus::FetchFailed);
    assert_eq!(summary.inserted, 0);

    let store = AppointmentStore::new(fixture.pool.clone());
    assert_eq!(store.count().await.expect("count"), 0);
    assert!(transport.attempts.lock().await.is_empty());
}

#[tokio::test]
async fn missing_snapshot_skips_the_tick() {
    let fixture = Fixture::new().await;
    let transport = Arc::new(RecordingTransport::default());
    let runner = fixture.runner(Box::new(ExternalSnapshot), transport.clone());

    let summary = runner.run_cycle().await.expect("cycle");
    assert_eq!(summary.status, CycleStatus::SnapshotMissing);
    assert!(transport.attempts.lock().await.is_empty());
}

#[tokio::test]
async fn failed_store_commit_sends_no_notifications() {
    let fixture = Fixture::new().await;
    fixture
        .seed_subscription("https://push.example/sub", "[]", "[]")
        .await;
    // Rejecting the second office fails the batch mid-transaction.
    sqlx::raw_sql(
        r#"
        CREATE TRIGGER reject_city_hall_b BEFORE INSERT ON appointments
        WHEN NEW.office_id = 8
        BEGIN SELECT RAISE(ABORT, 'office rejected'); END;
        "#,
    )
    .execute(&fixture.pool)
    .await
    .expect("trigger");
    fixture.write_snapshot(
        r#"{"PASSPORT": {
            "CityHallA": {"2024-06-01": {"appointmentTimestamps": [1717200000]}},
            "CityHallB": {"2024-06-01": {"appointmentTimestamps": [1717203600]}}
        }}"#,
    );

    let transport = Arc::new(RecordingTransport::default());
    let runner = fixture.runner(Box::new(ExternalSnapshot), transport.clone());

    assert!(runner.run_cycle().await.is_err());
    let store = AppointmentStore::new(fixture.pool.clone());
    assert_eq!(store.count().await.expect("count"), 0);
    assert!(transport.attempts.lock().await.is_empty());

    // The logging wrapper swallows the same error so a long-running caller
    // survives a bad tick.
    assert!(runner.run_cycle_logged().await.is_none());
    assert!(transport.attempts.lock().await.is_empty());
}

#[tokio::test]
async fn gone_subscription_is_removed_and_silent_next_cycle() {
    let fixture = Fixture::new().await;
    fixture
        .seed_subscription("https://push.example/dead", "[1]", "[]")
        .await;
    fixture.write_snapshot(SNAPSHOT);

    let transport = Arc::new(RecordingTransport {
        outcomes: [(
            "https://push.example/dead".to_string(),
            DeliveryOutcome::Gone,
        )]
        .into_iter()
        .collect(),
        attempts: Mutex::new(Vec::new()),
    });
    let runner = fixture.runner(Box::new(ExternalSnapshot), transport.clone());

    let first = runner.run_cycle().await.expect("first cycle");
    assert_eq!(first.delivery.attempted, 1);
    assert_eq!(first.delivery.gone_removed, 1);

    // A fresh slot appears; the dead endpoint must see zero attempts.
    fixture.write_snapshot(
        r#"{"PASSPORT": {"CityHallA": {"2024-06-01": {"appointmentTimestamps": [1717203600]}}}}"#,
    );
    let second = runner.run_cycle().await.expect("second cycle");
    assert_eq!(second.inserted, 1);
    assert_eq!(second.delivery.attempted, 0);
    assert_eq!(transport.attempts.lock().await.len(), 1);
}
