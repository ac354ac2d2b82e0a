//! Core domain model and the static service/office catalog for BBAN.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "bban-core";

/// A slot observed in the fetcher's snapshot, not yet persisted.
///
/// `location` carries the office key exactly as spelled in the snapshot and
/// is part of the appointment identity tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentCandidate {
    pub location: String,
    pub office_id: i64,
    pub service_id: i64,
    pub start_at: NaiveDateTime,
}

/// A persisted appointment slot.
///
/// Identity is `(location, office_id, service_id, start_at)`; rows are
/// created exactly once and never mutated. `fetched_at` is informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: i64,
    pub location: String,
    pub office_id: i64,
    pub service_id: i64,
    pub start_at: NaiveDateTime,
    pub fetched_at: DateTime<Utc>,
}

/// A subscriber's push credentials and matching preferences.
///
/// An empty `services` or `offices` set is a wildcard and matches every
/// value on that dimension. `schedule_note` is free-form and carried for
/// display only; it plays no part in matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub services: BTreeSet<i64>,
    pub offices: BTreeSet<i64>,
    pub schedule_note: Option<String>,
}

impl Subscription {
    /// Preference check for a single appointment; both dimensions must pass
    /// independently.
    pub fn wants(&self, service_id: i64, office_id: i64) -> bool {
        (self.services.is_empty() || self.services.contains(&service_id))
            && (self.offices.is_empty() || self.offices.contains(&office_id))
    }
}

/// One service the appointment source offers, e.g. passport issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub key: String,
    pub id: i64,
    pub display_name: String,
}

/// One office location appointments can be booked at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficeEntry {
    pub key: String,
    pub id: i64,
    pub display_name: String,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("duplicate service key {0}")]
    DuplicateServiceKey(String),
    #[error("duplicate service id {0}")]
    DuplicateServiceId(i64),
    #[error("duplicate office key {0}")]
    DuplicateOfficeKey(String),
    #[error("duplicate office id {0}")]
    DuplicateOfficeId(i64),
}

/// Read-only lookup table over the static service and office enumerations.
///
/// Built once at process start; reverse maps give O(1) resolution in both
/// directions instead of scanning the entry lists per appointment.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    services: Vec<ServiceEntry>,
    offices: Vec<OfficeEntry>,
    service_keys: HashMap<String, usize>,
    service_ids: HashMap<i64, usize>,
    office_keys: HashMap<String, usize>,
    office_ids: HashMap<i64, usize>,
}

impl Catalog {
    pub fn new(
        services: Vec<ServiceEntry>,
        offices: Vec<OfficeEntry>,
    ) -> Result<Self, CatalogError> {
        let mut service_keys = HashMap::with_capacity(services.len());
        let mut service_ids = HashMap::with_capacity(services.len());
        for (idx, entry) in services.iter().enumerate() {
            if service_keys.insert(entry.key.clone(), idx).is_some() {
                return Err(CatalogError::DuplicateServiceKey(entry.key.clone()));
            }
            if service_ids.insert(entry.id, idx).is_some() {
                return Err(CatalogError::DuplicateServiceId(entry.id));
            }
        }

        let mut office_keys = HashMap::with_capacity(offices.len());
        let mut office_ids = HashMap::with_capacity(offices.len());
        for (idx, entry) in offices.iter().enumerate() {
            if office_keys.insert(entry.key.clone(), idx).is_some() {
                return Err(CatalogError::DuplicateOfficeKey(entry.key.clone()));
            }
            if office_ids.insert(entry.id, idx).is_some() {
                return Err(CatalogError::DuplicateOfficeId(entry.id));
            }
        }

        Ok(Self {
            services,
            offices,
            service_keys,
            service_ids,
            office_keys,
            office_ids,
        })
    }

    pub fn service_by_key(&self, key: &str) -> Option<&ServiceEntry> {
        self.service_keys.get(key).map(|idx| &self.services[*idx])
    }

    pub fn office_by_key(&self, key: &str) -> Option<&OfficeEntry> {
        self.office_keys.get(key).map(|idx| &self.offices[*idx])
    }

    pub fn service_display(&self, id: i64) -> Option<&str> {
        self.service_ids
            .get(&id)
            .map(|idx| self.services[*idx].display_name.as_str())
    }

    pub fn office_display(&self, id: i64) -> Option<&str> {
        self.office_ids
            .get(&id)
            .map(|idx| self.offices[*idx].display_name.as_str())
    }

    pub fn services(&self) -> &[ServiceEntry] {
        &self.services
    }

    pub fn offices(&self) -> &[OfficeEntry] {
        &self.offices
    }
}
