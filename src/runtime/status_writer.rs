//! # Status Writer
//!
//! Mirrors the sync state table onto `PushSecret.status`.
//!
//! The writer follows the state watch channel and patches only the
//! resources whose computed status changed since the last patch.

use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

use crate::constants::FIELD_MANAGER;
use crate::controller::locks::lock;
use crate::controller::rules::RuleId;
use crate::controller::state::{StateSnapshot, SyncPhase, SyncRecord};
use crate::crd::{Condition, DestinationSyncStatus, PushSecret, PushSecretStatus};
use crate::runtime::watchers::ResourceIndex;

const STATUS_DEBOUNCE: Duration = Duration::from_secs(1);
const READY: &str = "Ready";

/// Status of a rule from its sync records
///
/// `Ready` is True once every destination is synced. The transition time is
/// kept from `previous` while the condition status does not change.
#[must_use]
pub fn build_status<'a>(
    records: impl IntoIterator<Item = &'a SyncRecord>,
    previous: Option<&PushSecretStatus>,
    now: DateTime<Utc>,
) -> PushSecretStatus {
    let destinations: Vec<DestinationSyncStatus> = records
        .into_iter()
        .map(|record| DestinationSyncStatus {
            secret: record.secret.to_string(),
            store: record.store.clone(),
            phase: record.phase.as_str().to_string(),
            synced_version: record.last_pushed_version,
            last_sync_time: record.last_success.map(|t| t.to_rfc3339()),
            last_attempt_time: record.last_attempt.map(|t| t.to_rfc3339()),
            retry_count: record.retry_count,
            reason: record.last_failure.as_ref().map(|f| f.kind.as_str().to_string()),
            message: record.last_failure.as_ref().map(|f| f.message.clone()),
        })
        .collect();

    let failed = destinations
        .iter()
        .filter(|d| d.phase == SyncPhase::Failed.as_str())
        .count();
    let synced = destinations
        .iter()
        .filter(|d| d.phase == SyncPhase::Synced.as_str())
        .count();
    let (status, reason, message) = if destinations.is_empty() {
        ("False", "NoSecrets", "no secret matches the source selector".to_string())
    } else if synced == destinations.len() {
        ("True", "Synced", format!("{synced} destination(s) synced"))
    } else if failed > 0 {
        (
            "False",
            "PushFailed",
            format!("{failed} of {} destination(s) failed", destinations.len()),
        )
    } else {
        (
            "False",
            "Progressing",
            format!("{synced} of {} destination(s) synced", destinations.len()),
        )
    };

    PushSecretStatus {
        conditions: vec![ready_condition(previous, status, reason, message, now)],
        destinations,
    }
}

/// Status of a `PushSecret` whose spec failed validation
#[must_use]
pub fn invalid_spec_status(previous: Option<&PushSecretStatus>, message: &str) -> PushSecretStatus {
    PushSecretStatus {
        conditions: vec![ready_condition(
            previous,
            "False",
            "InvalidSpec",
            message.to_string(),
            Utc::now(),
        )],
        destinations: previous.map(|p| p.destinations.clone()).unwrap_or_default(),
    }
}

fn ready_condition(
    previous: Option<&PushSecretStatus>,
    status: &str,
    reason: &str,
    message: String,
    now: DateTime<Utc>,
) -> Condition {
    let previous = previous.and_then(|p| p.conditions.iter().find(|c| c.r#type == READY));
    let last_transition_time = match previous {
        Some(condition) if condition.status == status => condition.last_transition_time.clone(),
        _ => Some(now.to_rfc3339()),
    };
    Condition {
        r#type: READY.to_string(),
        status: status.to_string(),
        last_transition_time,
        reason: Some(reason.to_string()),
        message: Some(message),
    }
}

/// Merge-patch the status subresource of a `PushSecret`
///
/// # Errors
/// Returns the API error; a missing resource is not an error.
pub async fn patch_status(client: &Client, rule: &RuleId, status: &PushSecretStatus) -> Result<(), kube::Error> {
    let api: Api<PushSecret> = Api::namespaced(client.clone(), &rule.namespace);
    let patch = serde_json::json!({ "status": status });
    match api
        .patch_status(&rule.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => {
            debug!("PushSecret {} is gone, status not written", rule);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Group records by rule
fn records_by_rule(snapshot: &StateSnapshot) -> BTreeMap<RuleId, Vec<&SyncRecord>> {
    let mut grouped: BTreeMap<RuleId, Vec<&SyncRecord>> = BTreeMap::new();
    for record in snapshot.values() {
        grouped.entry(record.rule.clone()).or_default().push(record);
    }
    grouped
}

/// Patch `PushSecret` statuses whenever the state table changes
pub async fn run_status_writer(
    client: Client,
    mut state: tokio::sync::watch::Receiver<StateSnapshot>,
    index: ResourceIndex,
) {
    let mut written: HashMap<RuleId, PushSecretStatus> = HashMap::new();
    loop {
        tokio::time::sleep(STATUS_DEBOUNCE).await;
        let snapshot = state.borrow_and_update().clone();
        let mut grouped = records_by_rule(&snapshot);

        let rules: Vec<RuleId> = lock(&index.rules).iter().cloned().collect();
        for rule in rules {
            let records = grouped.remove(&rule).unwrap_or_default();
            let previous = written.get(&rule);
            let status = build_status(records, previous, Utc::now());
            if previous == Some(&status) {
                continue;
            }
            match patch_status(&client, &rule, &status).await {
                Ok(()) => {
                    written.insert(rule, status);
                }
                Err(e) => warn!("Failed to patch status of PushSecret {}: {}", rule, e),
            }
        }
        written.retain(|rule, _| index.contains_rule(rule));

        if state.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::state::{FailureInfo, FailureKind};
    use crate::secret::SecretId;

    fn record(store: &str, phase: SyncPhase) -> SyncRecord {
        let mut record = SyncRecord::new(
            SecretId::new("payments", "db"),
            RuleId::new("payments", "db-push"),
            store.to_string(),
        );
        record.phase = phase;
        record
    }

    #[test]
    fn test_ready_when_all_synced() {
        let records = [record("vault-r1", SyncPhase::Synced), record("vault-r2", SyncPhase::Synced)];
        let status = build_status(&records, None, Utc::now());
        assert_eq!(status.conditions[0].status, "True");
        assert_eq!(status.destinations.len(), 2);
    }

    #[test]
    fn test_failed_destination_is_reported() {
        let mut failed = record("vault-r2", SyncPhase::Failed);
        failed.retry_count = 2;
        failed.last_failure = Some(FailureInfo {
            kind: FailureKind::Unavailable,
            message: "vault-r2 returned 503".to_string(),
            at: Utc::now(),
        });
        let records = [record("vault-r1", SyncPhase::Synced), failed];
        let status = build_status(&records, None, Utc::now());

        let condition = &status.conditions[0];
        assert_eq!(condition.status, "False");
        assert_eq!(condition.reason.as_deref(), Some("PushFailed"));
        assert_eq!(status.destinations[1].reason.as_deref(), Some("Unavailable"));
        assert_eq!(status.destinations[1].retry_count, 2);
    }

    #[test]
    fn test_transition_time_kept_while_status_unchanged() {
        let earlier = Utc::now() - chrono::TimeDelta::hours(1);
        let records = [record("vault-r1", SyncPhase::Synced)];
        let first = build_status(&records, None, earlier);
        let second = build_status(&records, Some(&first), Utc::now());
        assert_eq!(
            first.conditions[0].last_transition_time,
            second.conditions[0].last_transition_time
        );
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_records() {
        let status = build_status(std::iter::empty(), None, Utc::now());
        assert_eq!(status.conditions[0].reason.as_deref(), Some("NoSecrets"));
    }
}
