//! Before-mutation capture of service state, to support restore.
//!
//! Ported from `snapshots.py`. Every mutating administrative action on a
//! service (deactivate, mute, edit, etc.) captures a full snapshot of the
//! row *before* the mutation; restoring replays that snapshot back onto
//! the service, preserving identity fields.

use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use thiserror::Error;

use crate::store::models::{Service, SnapshotActionType, SnapshotRow};
use crate::store::{Store, StoreError};

/// Errors from snapshot capture or restore.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The referenced snapshot id does not exist.
    #[error("snapshot not found")]
    NotFound,
    /// The snapshot has already been restored once.
    #[error("snapshot already restored")]
    AlreadyRestored,
    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Capture `service`'s current row as a snapshot before a mutating change.
pub async fn capture(
    store: &Store,
    service: &Service,
    action_type: SnapshotActionType,
    actor: Option<&str>,
    now: DateTime<Utc>,
) -> Result<i64, SnapshotError> {
    let snapshot_data = serde_json::to_value(service).unwrap_or(Json::Null);
    let id = store
        .insert_snapshot(service.id, &snapshot_data, action_type, actor, now)
        .await?;
    Ok(id)
}

/// Restore a service from a previously captured snapshot.
///
/// The service's `id` and `heartbeat_name` are preserved from the current
/// row rather than the snapshot, so a restore can never reassign a
/// service's identity or collide with another service's unique name.
pub async fn restore(store: &Store, snapshot_id: i64, now: DateTime<Utc>) -> Result<Service, SnapshotError> {
    let snapshot = store
        .get_snapshot(snapshot_id)
        .await?
        .ok_or(SnapshotError::NotFound)?;
    if snapshot.restored_at.is_some() {
        return Err(SnapshotError::AlreadyRestored);
    }

    let current = store
        .get_service(snapshot.service_id)
        .await?
        .ok_or(SnapshotError::NotFound)?;

    let mut restored: Service =
        serde_json::from_value(snapshot.snapshot_data.clone()).map_err(|_| SnapshotError::NotFound)?;
    restored.id = current.id;
    restored.heartbeat_name = current.heartbeat_name;

    store.overwrite_service(snapshot.service_id, &restored).await?;
    store.mark_snapshot_restored(snapshot_id, now).await?;
    Ok(restored)
}

/// Paginated, filterable listing of snapshots.
pub struct SnapshotQuery {
    pub service_id: Option<i64>,
    pub action_type: Option<SnapshotActionType>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

/// Errors validating a [`SnapshotQuery`]'s pagination bounds.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    /// `limit` fell outside `[1, max_limit]`.
    #[error("limit must be between 1 and {0}")]
    LimitOutOfRange(i64),
}

impl SnapshotQuery {
    /// Validate `limit` against the configured maximum (default 250 per
    /// spec §4.11) before querying.
    pub fn validate(&self, max_limit: i64) -> Result<(), QueryError> {
        if self.limit < 1 || self.limit > max_limit {
            return Err(QueryError::LimitOutOfRange(max_limit));
        }
        Ok(())
    }
}

/// Query snapshots with filters, returning `(rows, total_matching)`.
pub async fn query(store: &Store, q: &SnapshotQuery, max_limit: i64) -> Result<(Vec<SnapshotRow>, i64), SnapshotError> {
    q.validate(max_limit).map_err(|_| SnapshotError::NotFound)?;
    let result = store
        .query_snapshots(
            q.service_id,
            q.action_type,
            q.start_date,
            q.end_date,
            q.limit,
            q.offset,
        )
        .await?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_service(store: &Store) -> Service {
        let now = Utc::now();
        let service = Service {
            id: 0,
            heartbeat_name: "svc".to_owned(),
            service_name: "svc".to_owned(),
            active: true,
            muted: false,
            down: false,
            alert_interval: 5,
            threshold: 1,
            grace_period_seconds: 0,
            team_id: None,
            priority: "p3".to_owned(),
            runbook: None,
            max_duration_ms: None,
            created_at: now,
            updated_at: now,
        };
        let id = store.insert_service(&service).await.expect("insert service");
        store.get_service(id).await.expect("load").expect("exists")
    }

    #[tokio::test]
    async fn capture_then_restore_preserves_identity() {
        let store = Store::open_in_memory().await.expect("open store");
        let service = seed_service(&store).await;
        let now = Utc::now();

        let snapshot_id = capture(&store, &service, SnapshotActionType::Mute, Some("alice"), now)
            .await
            .expect("capture");

        store
            .update_service(
                service.id,
                &crate::store::models::ServicePatch {
                    muted: Some(true),
                    ..Default::default()
                },
            )
            .await
            .expect("mute");

        let restored = restore(&store, snapshot_id, now).await.expect("restore");
        assert_eq!(restored.id, service.id);
        assert_eq!(restored.heartbeat_name, service.heartbeat_name);
        assert!(!restored.muted);
    }

    #[tokio::test]
    async fn restoring_twice_is_rejected() {
        let store = Store::open_in_memory().await.expect("open store");
        let service = seed_service(&store).await;
        let now = Utc::now();
        let snapshot_id = capture(&store, &service, SnapshotActionType::Edit, None, now)
            .await
            .expect("capture");

        restore(&store, snapshot_id, now).await.expect("first restore");
        let second = restore(&store, snapshot_id, now).await;
        assert!(matches!(second, Err(SnapshotError::AlreadyRestored)));
    }

    #[test]
    fn query_rejects_limit_out_of_range() {
        let q = SnapshotQuery {
            service_id: None,
            action_type: None,
            start_date: None,
            end_date: None,
            limit: 0,
            offset: 0,
        };
        assert!(q.validate(250).is_err());
        let q = SnapshotQuery { limit: 251, ..q };
        assert!(q.validate(250).is_err());
    }
}
