//! Argus Sync Core - Validation, membership enforcement, canonical writes

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::errors::ApiError;
use crate::models::*;
use crate::storage::ArgusStorage;

/// Maximum serialized annotation payload, in bytes.
const MAX_ANNOTATION_BYTES: usize = 50 * 1024;
const MAX_ANNOTATION_CATEGORY_LEN: usize = 64;
const MAX_MESSAGE_LEN: usize = 2000;
/// Client clock skew tolerated on location timestamps.
const MAX_TIMESTAMP_AGE_DAYS: i64 = 7;
const MAX_TIMESTAMP_SKEW_MINUTES: i64 = 5;

/// Typed broadcast seam. The realtime gateway is the sole production
/// implementer; tests record events instead.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast_to_team(&self, team_id: Uuid, event: ServerEvent);
    async fn broadcast_to_admins(&self, event: ServerEvent);
}

/// Validates payloads, enforces team membership, writes canonical state and
/// emits broadcast events only after the write is durable.
pub struct SyncCore {
    storage: Arc<ArgusStorage>,
    broadcaster: Arc<dyn Broadcaster>,
}

fn round7(value: f64) -> f64 {
    (value * 1e7).round() / 1e7
}

impl SyncCore {
    pub fn new(storage: Arc<ArgusStorage>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { storage, broadcaster }
    }

    /// Membership is the sole authorization gate for team-scoped data.
    pub async fn assert_membership(&self, user_id: Uuid, team_id: Uuid) -> Result<(), ApiError> {
        if self.storage.is_member(user_id, team_id).await? {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }

    pub async fn submit_location(
        &self,
        user_id: Uuid,
        payload: LocationPayload,
    ) -> Result<LocationSample, ApiError> {
        Self::validate_location(&payload)?;
        self.assert_membership(user_id, payload.team_id).await?;

        let sample = LocationSample {
            id: Uuid::new_v4(),
            user_id,
            team_id: payload.team_id,
            latitude: round7(payload.latitude),
            longitude: round7(payload.longitude),
            altitude: payload.altitude,
            accuracy: payload.accuracy,
            timestamp: payload.timestamp,
            created_at: Utc::now(),
        };
        self.storage.insert_location(&sample).await?;

        self.broadcaster
            .broadcast_to_team(
                sample.team_id,
                ServerEvent::LocationUpdate(LocationBroadcast {
                    user_id,
                    team_id: sample.team_id,
                    latitude: sample.latitude,
                    longitude: sample.longitude,
                    altitude: sample.altitude,
                    accuracy: sample.accuracy,
                    timestamp: sample.timestamp,
                }),
            )
            .await;
        self.emit_activity("location", user_id, sample.team_id).await;

        Ok(sample)
    }

    pub async fn submit_annotation(
        &self,
        user_id: Uuid,
        payload: AnnotationPayload,
    ) -> Result<Annotation, ApiError> {
        Self::validate_annotation(&payload)?;
        self.assert_membership(user_id, payload.team_id).await?;

        let now = Utc::now();
        let annotation = Annotation {
            id: payload.annotation_id.unwrap_or_else(Uuid::new_v4),
            user_id,
            team_id: payload.team_id,
            category: payload.category,
            data: payload.data,
            created_at: now,
            updated_at: now,
        };
        // Conflict-by-id merge; the database keeps created_at and team_id
        // from the first writer.
        let stored = self.storage.upsert_annotation(&annotation).await?;

        self.broadcaster
            .broadcast_to_team(stored.team_id, ServerEvent::AnnotationUpdate(stored.clone()))
            .await;
        self.emit_activity("annotation", user_id, stored.team_id).await;

        Ok(stored)
    }

    pub async fn submit_message(
        &self,
        user_id: Uuid,
        payload: MessagePayload,
    ) -> Result<Message, ApiError> {
        Self::validate_message(&payload)?;
        self.assert_membership(user_id, payload.team_id).await?;

        let message = Message {
            id: Uuid::new_v4(),
            user_id,
            team_id: payload.team_id,
            message_type: payload.message_type,
            content: payload.content,
            created_at: Utc::now(),
        };
        self.storage.insert_message(&message).await?;

        self.broadcaster
            .broadcast_to_team(message.team_id, ServerEvent::MessageReceived(message.clone()))
            .await;
        self.emit_activity("message", user_id, message.team_id).await;

        Ok(message)
    }

    async fn emit_activity(&self, kind: &str, user_id: Uuid, team_id: Uuid) {
        debug!(kind, user_id = %user_id, team_id = %team_id, "Sync write committed");
        self.broadcaster
            .broadcast_to_admins(ServerEvent::AdminSyncActivity(SyncActivity {
                kind: kind.to_string(),
                user_id,
                team_id,
                at: Utc::now(),
            }))
            .await;
    }

    fn validate_location(payload: &LocationPayload) -> Result<(), ApiError> {
        if !payload.latitude.is_finite() || !(-90.0..=90.0).contains(&payload.latitude) {
            return Err(ApiError::validation("latitude must be within [-90, 90]"));
        }
        if !payload.longitude.is_finite() || !(-180.0..=180.0).contains(&payload.longitude) {
            return Err(ApiError::validation("longitude must be within [-180, 180]"));
        }
        if let Some(altitude) = payload.altitude {
            if !altitude.is_finite() || !(-500.0..=15000.0).contains(&altitude) {
                return Err(ApiError::validation("altitude must be within [-500, 15000]"));
            }
        }
        if let Some(accuracy) = payload.accuracy {
            if !accuracy.is_finite() || !(0.0..=10000.0).contains(&accuracy) {
                return Err(ApiError::validation("accuracy must be within [0, 10000]"));
            }
        }

        let now = Utc::now();
        let oldest = (now - Duration::days(MAX_TIMESTAMP_AGE_DAYS)).timestamp_millis();
        let newest = (now + Duration::minutes(MAX_TIMESTAMP_SKEW_MINUTES)).timestamp_millis();
        if payload.timestamp < oldest || payload.timestamp > newest {
            return Err(ApiError::validation(
                "timestamp must be within the last 7 days and at most 5 minutes ahead",
            ));
        }
        Ok(())
    }

    fn validate_annotation(payload: &AnnotationPayload) -> Result<(), ApiError> {
        if payload.category.is_empty() || payload.category.len() > MAX_ANNOTATION_CATEGORY_LEN {
            return Err(ApiError::validation("type must be 1-64 characters"));
        }
        if !payload.data.is_object() {
            return Err(ApiError::validation("data must be an object"));
        }
        let serialized = serde_json::to_vec(&payload.data)
            .map_err(|_| ApiError::validation("data is not serializable"))?;
        if serialized.len() > MAX_ANNOTATION_BYTES {
            return Err(ApiError::validation("data exceeds 50 KB"));
        }
        Ok(())
    }

    fn validate_message(payload: &MessagePayload) -> Result<(), ApiError> {
        if payload.content.is_empty() || payload.content.chars().count() > MAX_MESSAGE_LEN {
            return Err(ApiError::validation("content must be 1-2000 characters"));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex;

    /// Records every emitted event instead of fanning out.
    #[derive(Default)]
    pub struct RecordingBroadcaster {
        pub team_events: Mutex<Vec<(Uuid, ServerEvent)>>,
        pub admin_events: Mutex<Vec<ServerEvent>>,
    }

    #[async_trait]
    impl Broadcaster for RecordingBroadcaster {
        async fn broadcast_to_team(&self, team_id: Uuid, event: ServerEvent) {
            self.team_events.lock().await.push((team_id, event));
        }

        async fn broadcast_to_admins(&self, event: ServerEvent) {
            self.admin_events.lock().await.push(event);
        }
    }

    pub async fn sync_fixture() -> (SyncCore, Arc<ArgusStorage>, Arc<RecordingBroadcaster>, Uuid, Uuid)
    {
        let storage = Arc::new(ArgusStorage::new_in_memory().await.unwrap());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let sync = SyncCore::new(storage.clone(), broadcaster.clone());

        let user_id = Uuid::new_v4();
        let team_id = Uuid::new_v4();
        storage
            .create_user(&User {
                id: user_id,
                name: "scout".to_string(),
                email: None,
                password_hash: "x".to_string(),
                is_admin: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        storage
            .create_team(&Team {
                id: team_id,
                name: "bravo".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        storage.add_member(user_id, team_id).await.unwrap();

        (sync, storage, broadcaster, user_id, team_id)
    }

    fn location(team_id: Uuid) -> LocationPayload {
        LocationPayload {
            team_id,
            latitude: 47.60621345678,
            longitude: -122.33207123456,
            altitude: Some(56.0),
            accuracy: Some(8.0),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn test_location_rejected_for_non_member() {
        let (sync, storage, broadcaster, _user, team_id) = sync_fixture().await;
        let outsider = Uuid::new_v4();

        let err = sync.submit_location(outsider, location(team_id)).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden));
        assert_eq!(storage.count_locations(team_id).await.unwrap(), 0);
        assert!(broadcaster.team_events.lock().await.is_empty());
        assert!(broadcaster.admin_events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_location_persists_then_broadcasts_rounded() {
        let (sync, storage, broadcaster, user_id, team_id) = sync_fixture().await;

        let sample = sync.submit_location(user_id, location(team_id)).await.unwrap();
        assert_eq!(sample.latitude, 47.6062135);
        assert_eq!(sample.longitude, -122.3320712);
        assert_eq!(storage.count_locations(team_id).await.unwrap(), 1);

        let events = broadcaster.team_events.lock().await;
        assert_eq!(events.len(), 1);
        let (target, event) = &events[0];
        assert_eq!(*target, team_id);
        match event {
            ServerEvent::LocationUpdate(update) => {
                assert_eq!(update.user_id, user_id);
                assert_eq!(update.latitude, 47.6062135);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(broadcaster.admin_events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_location_validation_bounds() {
        let (sync, storage, _broadcaster, user_id, team_id) = sync_fixture().await;

        let mut bad = location(team_id);
        bad.latitude = 90.5;
        assert!(matches!(
            sync.submit_location(user_id, bad).await.unwrap_err(),
            ApiError::Validation(_)
        ));

        let mut bad = location(team_id);
        bad.longitude = f64::NAN;
        assert!(matches!(
            sync.submit_location(user_id, bad).await.unwrap_err(),
            ApiError::Validation(_)
        ));

        let mut bad = location(team_id);
        bad.timestamp = (Utc::now() - Duration::days(8)).timestamp_millis();
        assert!(matches!(
            sync.submit_location(user_id, bad).await.unwrap_err(),
            ApiError::Validation(_)
        ));

        let mut bad = location(team_id);
        bad.timestamp = (Utc::now() + Duration::minutes(6)).timestamp_millis();
        assert!(matches!(
            sync.submit_location(user_id, bad).await.unwrap_err(),
            ApiError::Validation(_)
        ));

        let mut bad = location(team_id);
        bad.altitude = Some(20000.0);
        assert!(matches!(
            sync.submit_location(user_id, bad).await.unwrap_err(),
            ApiError::Validation(_)
        ));

        assert_eq!(storage.count_locations(team_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_annotation_upsert_is_idempotent() {
        let (sync, _storage, _broadcaster, user_id, team_id) = sync_fixture().await;
        let annotation_id = Uuid::new_v4();
        let payload = AnnotationPayload {
            team_id,
            annotation_id: Some(annotation_id),
            category: "marker".to_string(),
            data: json!({"label": "rally point"}),
        };

        let first = sync.submit_annotation(user_id, payload.clone()).await.unwrap();
        let second = sync.submit_annotation(user_id, payload).await.unwrap();

        assert_eq!(first.id, annotation_id);
        assert_eq!(second.id, annotation_id);
        assert_eq!(second.data, first.data);
        assert_eq!(second.created_at.timestamp(), first.created_at.timestamp());
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn test_annotation_size_and_category_limits() {
        let (sync, _storage, _broadcaster, user_id, team_id) = sync_fixture().await;

        let oversize = AnnotationPayload {
            team_id,
            annotation_id: None,
            category: "marker".to_string(),
            data: json!({"blob": "x".repeat(51 * 1024)}),
        };
        assert!(matches!(
            sync.submit_annotation(user_id, oversize).await.unwrap_err(),
            ApiError::Validation(_)
        ));

        let long_category = AnnotationPayload {
            team_id,
            annotation_id: None,
            category: "c".repeat(65),
            data: json!({}),
        };
        assert!(matches!(
            sync.submit_annotation(user_id, long_category).await.unwrap_err(),
            ApiError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_message_length_limits() {
        let (sync, _storage, broadcaster, user_id, team_id) = sync_fixture().await;

        let empty = MessagePayload {
            team_id,
            message_type: MessageType::Text,
            content: String::new(),
        };
        assert!(matches!(
            sync.submit_message(user_id, empty).await.unwrap_err(),
            ApiError::Validation(_)
        ));

        let long = MessagePayload {
            team_id,
            message_type: MessageType::Text,
            content: "m".repeat(2001),
        };
        assert!(matches!(
            sync.submit_message(user_id, long).await.unwrap_err(),
            ApiError::Validation(_)
        ));
        assert!(broadcaster.team_events.lock().await.is_empty());

        let ok = MessagePayload {
            team_id,
            message_type: MessageType::Text,
            content: "m".repeat(2000),
        };
        let message = sync.submit_message(user_id, ok).await.unwrap();
        assert_eq!(message.content.chars().count(), 2000);
    }
}
