//! Matching and delivery: preference index, payload rendering, and the web
//! push transport with permanent-failure reconciliation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use bban_core::{Appointment, Catalog, Subscription};
use bban_storage::SubscriptionStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use web_push::{
    ContentEncoding, IsahcWebPushClient, SubscriptionInfo, VapidSignatureBuilder, WebPushClient,
    WebPushError, WebPushMessageBuilder,
};

pub const CRATE_NAME: &str = "bban-notify";

/// Per-cycle lookup from appointment to interested subscribers.
///
/// Rebuilt from the full subscription set every cycle. Each dimension keeps
/// id-keyed buckets plus a wildcard bucket for subscriptions with an empty
/// preference set on that dimension; a match is the intersection of both
/// dimensions. An empty preference set on a dimension matches every value
/// on that dimension.
#[derive(Debug, Default)]
pub struct PreferenceIndex {
    subscriptions: Vec<Subscription>,
    service_buckets: HashMap<i64, Vec<usize>>,
    any_service: Vec<usize>,
    office_buckets: HashMap<i64, Vec<usize>>,
    any_office: Vec<usize>,
}

impl PreferenceIndex {
    pub fn build(subscriptions: Vec<Subscription>) -> Self {
        let mut index = Self {
            subscriptions,
            ..Self::default()
        };
        for (idx, subscription) in index.subscriptions.iter().enumerate() {
            if subscription.services.is_empty() {
                index.any_service.push(idx);
            } else {
                for &service_id in &subscription.services {
                    index.service_buckets.entry(service_id).or_default().push(idx);
                }
            }
            if subscription.offices.is_empty() {
                index.any_office.push(idx);
            } else {
                for &office_id in &subscription.offices {
                    index.office_buckets.entry(office_id).or_default().push(idx);
                }
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Subscribers whose preferences accept this appointment, in stable
    /// (insertion id) order.
    pub fn matches(&self, appointment: &Appointment) -> Vec<&Subscription> {
        let mut service_side: BTreeSet<usize> = self.any_service.iter().copied().collect();
        if let Some(bucket) = self.service_buckets.get(&appointment.service_id) {
            service_side.extend(bucket.iter().copied());
        }

        let mut office_side: BTreeSet<usize> = self.any_office.iter().copied().collect();
        if let Some(bucket) = self.office_buckets.get(&appointment.office_id) {
            office_side.extend(bucket.iter().copied());
        }

        service_side
            .intersection(&office_side)
            .map(|&idx| &self.subscriptions[idx])
            .collect()
    }
}

/// The two-field document pushed to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub message: String,
}

/// Renders the human-readable payload for one appointment. Lookup misses fall
/// back to placeholder names; a stale catalog must never fail the cycle.
pub fn render_payload(catalog: &Catalog, appointment: &Appointment) -> NotificationPayload {
    let service = catalog
        .service_display(appointment.service_id)
        .unwrap_or("Unknown Service");
    let office = catalog
        .office_display(appointment.office_id)
        .unwrap_or("Unknown Office");
    NotificationPayload {
        title: "New Appointment Available!".to_string(),
        message: format!(
            "{service} at {office} on {}",
            appointment.start_at.format("%Y-%m-%d %H:%M")
        ),
    }
}

/// Result of one delivery attempt. `Gone` means the remote endpoint no longer
/// exists and will never succeed again; `Failed` covers everything transient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Gone,
    Failed(String),
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(
        &self,
        subscription: &Subscription,
        payload: &NotificationPayload,
    ) -> DeliveryOutcome;
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("web push error: {0}")]
    WebPush(#[from] WebPushError),
    #[error("encoding payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("reading VAPID private key {path}: {source}")]
    VapidKey {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub vapid_private_key: PathBuf,
    /// Sender identity claim, e.g. `mailto:ops@example.org`.
    pub vapid_subject: String,
    pub ttl_secs: u32,
}

/// Web Push delivery with VAPID authentication and aes128gcm payload
/// encryption, via the `web-push` crate.
pub struct WebPushTransport {
    client: IsahcWebPushClient,
    vapid_pem: Vec<u8>,
    subject: String,
    ttl_secs: u32,
}

impl WebPushTransport {
    pub fn new(config: PushConfig) -> Result<Self, NotifyError> {
        let vapid_pem =
            std::fs::read(&config.vapid_private_key).map_err(|source| NotifyError::VapidKey {
                path: config.vapid_private_key.display().to_string(),
                source,
            })?;
        Ok(Self {
            client: IsahcWebPushClient::new()?,
            vapid_pem,
            subject: config.vapid_subject,
            ttl_secs: config.ttl_secs,
        })
    }

    async fn send(
        &self,
        subscription: &Subscription,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        let info = SubscriptionInfo::new(
            subscription.endpoint.clone(),
            subscription.p256dh.clone(),
            subscription.auth.clone(),
        );

        let signature = {
            let mut builder = VapidSignatureBuilder::from_pem(self.vapid_pem.as_slice(), &info)?;
            builder.add_claim("sub", self.subject.clone());
            builder.build()?
        };

        let body = serde_json::to_vec(payload)?;
        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_payload(ContentEncoding::Aes128Gcm, &body);
        builder.set_vapid_signature(signature);
        builder.set_ttl(self.ttl_secs);

        self.client.send(builder.build()?).await?;
        Ok(())
    }
}

#[async_trait]
impl PushTransport for WebPushTransport {
    async fn deliver(
        &self,
        subscription: &Subscription,
        payload: &NotificationPayload,
    ) -> DeliveryOutcome {
        match self.send(subscription, payload).await {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(NotifyError::WebPush(
                WebPushError::EndpointNotValid | WebPushError::EndpointNotFound,
            )) => DeliveryOutcome::Gone,
            Err(err) => DeliveryOutcome::Failed(err.to_string()),
        }
    }
}

/// Per-cycle delivery accounting, for logging only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub sent: usize,
    pub gone_removed: usize,
    pub failed: usize,
}

/// Delivers to every matching (appointment, subscriber) pair. Each pair is an
/// independent unit of work: a transient failure is logged and skipped, a
/// permanent failure deletes the subscription record immediately, and an
/// endpoint confirmed gone is not attempted again within the cycle.
pub async fn notify_matches(
    catalog: &Catalog,
    index: &PreferenceIndex,
    new_appointments: &[Appointment],
    transport: &dyn PushTransport,
    subscriptions: &SubscriptionStore,
) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    let mut dead_endpoints: HashSet<String> = HashSet::new();

    for appointment in new_appointments {
        let payload = render_payload(catalog, appointment);
        for subscription in index.matches(appointment) {
            if dead_endpoints.contains(&subscription.endpoint) {
                continue;
            }
            report.attempted += 1;
            match transport.deliver(subscription, &payload).await {
                DeliveryOutcome::Delivered => {
                    info!(endpoint = %subscription.endpoint, "notification sent");
                    report.sent += 1;
                }
                DeliveryOutcome::Gone => {
                    warn!(endpoint = %subscription.endpoint, "push endpoint gone, removing subscription");
                    match subscriptions.delete_by_endpoint(&subscription.endpoint).await {
                        Ok(_) => report.gone_removed += 1,
                        Err(err) => {
                            error!(endpoint = %subscription.endpoint, error = %err, "failed to remove dead subscription");
                        }
                    }
                    dead_endpoints.insert(subscription.endpoint.clone());
                }
                DeliveryOutcome::Failed(reason) => {
                    warn!(endpoint = %subscription.endpoint, %reason, "push delivery failed");
                    report.failed += 1;
                }
            }
        }
    }

    report
}
