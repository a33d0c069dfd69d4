//! Argus Config Cache - TTL-cached deployment configuration

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::errors::ApiError;
use crate::storage::ArgusStorage;

const CACHE_TTL: Duration = Duration::from_secs(60);
const WRITE_ATTEMPTS: u32 = 3;

/// The enumerated configuration key set persisted in the config table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    SetupCompleted,
    JwtSecret,
    EncryptionKey,
    CorsOrigin,
    OrgName,
    FeatureToggles,
    RetentionDays,
    AiApiKey,
    AiBaseUrl,
    AiSearchModel,
    AiDedupModel,
}

impl ConfigKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SetupCompleted => "setup_completed",
            Self::JwtSecret => "jwt_secret",
            Self::EncryptionKey => "encryption_key",
            Self::CorsOrigin => "cors_origin",
            Self::OrgName => "org_name",
            Self::FeatureToggles => "feature_toggles",
            Self::RetentionDays => "retention_days",
            Self::AiApiKey => "ai_api_key",
            Self::AiBaseUrl => "ai_base_url",
            Self::AiSearchModel => "ai_search_model",
            Self::AiDedupModel => "ai_dedup_model",
        }
    }
}

#[derive(Debug, Clone)]
struct CachedEntry {
    value: Option<JsonValue>,
    fetched_at: Instant,
}

/// Process-wide config mapping with a 60-second TTL per entry. Writes go
/// through to the store and invalidate the written key; readers may observe
/// a stale value until their cached entry expires.
pub struct ConfigCache {
    storage: Arc<ArgusStorage>,
    entries: RwLock<HashMap<&'static str, CachedEntry>>,
    ttl: Duration,
}

impl ConfigCache {
    pub fn new(storage: Arc<ArgusStorage>) -> Self {
        Self {
            storage,
            entries: RwLock::new(HashMap::new()),
            ttl: CACHE_TTL,
        }
    }

    #[cfg(test)]
    pub fn with_ttl(storage: Arc<ArgusStorage>, ttl: Duration) -> Self {
        Self {
            storage,
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn get(&self, key: ConfigKey) -> Result<Option<JsonValue>, ApiError> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key.as_str()) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.value.clone());
                }
            }
        }

        let value = self.storage.get_config(key.as_str()).await?;

        let mut entries = self.entries.write().await;
        entries.insert(
            key.as_str(),
            CachedEntry {
                value: value.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(value)
    }

    /// Write-through with per-key invalidation. Config writes are critical,
    /// so the store write retries with exponential back-off.
    pub async fn set(&self, key: ConfigKey, value: JsonValue) -> Result<(), ApiError> {
        let mut delay = Duration::from_millis(200);
        let mut last_err = None;
        for attempt in 1..=WRITE_ATTEMPTS {
            match self.storage.set_config(key.as_str(), &value).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!(key = key.as_str(), attempt, error = %err, "Config write failed");
                    last_err = Some(err);
                    if attempt < WRITE_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        if let Some(err) = last_err {
            return Err(err);
        }

        let mut entries = self.entries.write().await;
        entries.remove(key.as_str());
        debug!(key = key.as_str(), "Config updated");
        Ok(())
    }

    pub async fn get_string(&self, key: ConfigKey) -> Result<Option<String>, ApiError> {
        Ok(self
            .get(key)
            .await?
            .and_then(|v| v.as_str().map(|s| s.to_string())))
    }

    pub async fn get_bool(&self, key: ConfigKey) -> Result<bool, ApiError> {
        Ok(self
            .get(key)
            .await?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    pub async fn get_i64(&self, key: ConfigKey) -> Result<Option<i64>, ApiError> {
        Ok(self.get(key).await?.and_then(|v| v.as_i64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn cache() -> ConfigCache {
        let storage = Arc::new(ArgusStorage::new_in_memory().await.unwrap());
        ConfigCache::new(storage)
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let cache = cache().await;
        assert_eq!(cache.get(ConfigKey::OrgName).await.unwrap(), None);
        assert!(!cache.get_bool(ConfigKey::SetupCompleted).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_through_and_invalidate() {
        let cache = cache().await;
        // Prime the cache with the missing value.
        assert_eq!(cache.get(ConfigKey::OrgName).await.unwrap(), None);

        cache
            .set(ConfigKey::OrgName, json!("Field Ops"))
            .await
            .unwrap();
        // The write invalidated the key, so the fresh value is visible
        // immediately despite the TTL.
        assert_eq!(
            cache.get_string(ConfigKey::OrgName).await.unwrap(),
            Some("Field Ops".to_string())
        );
    }

    #[tokio::test]
    async fn test_stale_entry_served_until_ttl() {
        let storage = Arc::new(ArgusStorage::new_in_memory().await.unwrap());
        let cache = ConfigCache::with_ttl(storage.clone(), Duration::from_millis(30));

        storage
            .set_config(ConfigKey::RetentionDays.as_str(), &json!(7))
            .await
            .unwrap();
        assert_eq!(cache.get_i64(ConfigKey::RetentionDays).await.unwrap(), Some(7));

        // Out-of-band store write is not visible until the entry expires.
        storage
            .set_config(ConfigKey::RetentionDays.as_str(), &json!(30))
            .await
            .unwrap();
        assert_eq!(cache.get_i64(ConfigKey::RetentionDays).await.unwrap(), Some(7));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get_i64(ConfigKey::RetentionDays).await.unwrap(), Some(30));
    }
}
