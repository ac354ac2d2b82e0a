//! Snapshot reader: flattens the fetcher's nested JSON document into
//! appointment candidates, resolving names against the static catalog.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use bban_core::{AppointmentCandidate, Catalog};
use chrono::{Local, TimeZone};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "bban-snapshot";

/// `service_key -> office_key -> date_key -> slots`, as the fetcher writes it.
pub type SnapshotDoc = BTreeMap<String, BTreeMap<String, BTreeMap<String, DayEntry>>>;

/// One date's worth of slots. A day without `appointmentTimestamps` is a
/// fetch error or an empty day, not data to ingest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DayEntry {
    #[serde(default, rename = "appointmentTimestamps")]
    pub appointment_timestamps: Option<Vec<i64>>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("reading snapshot {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing snapshot document: {0}")]
    Parse(#[from] serde_json::Error),
}

pub fn parse_snapshot(text: &str) -> Result<SnapshotDoc, SnapshotError> {
    Ok(serde_json::from_str(text)?)
}

pub fn load_snapshot(path: impl AsRef<Path>) -> Result<SnapshotDoc, SnapshotError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| SnapshotError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_snapshot(&text)
}

/// Flattens a snapshot into candidates in deterministic (sorted) order.
///
/// Names the catalog cannot resolve are logged and skipped; the fetcher's
/// vocabulary may drift ahead of the enumerations and one unknown key must
/// not abort the tick. Epoch seconds convert to local-timezone datetimes.
pub fn candidates_from_snapshot(doc: &SnapshotDoc, catalog: &Catalog) -> Vec<AppointmentCandidate> {
    let mut candidates = Vec::new();

    for (service_key, offices) in doc {
        let Some(service) = catalog.service_by_key(service_key) else {
            warn!(service = %service_key, "unknown service in snapshot, skipping");
            continue;
        };

        for (office_key, dates) in offices {
            let Some(office) = catalog.office_by_key(office_key) else {
                warn!(office = %office_key, "unknown office in snapshot, skipping");
                continue;
            };

            for day in dates.values() {
                let Some(timestamps) = &day.appointment_timestamps else {
                    continue;
                };
                for &epoch in timestamps {
                    let Some(start_at) = Local.timestamp_opt(epoch, 0).single() else {
                        warn!(epoch, "timestamp not representable in local time, skipping");
                        continue;
                    };
                    candidates.push(AppointmentCandidate {
                        location: office_key.clone(),
                        office_id: office.id,
                        service_id: service.id,
                        start_at: start_at.naive_local(),
                    });
                }
            }
        }
    }

    candidates
}
