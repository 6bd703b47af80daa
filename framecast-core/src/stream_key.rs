//! Stream-key generation, storage, and publish validation.
//!
//! Key material is opaque (nanoid) and never stored: records are keyed
//! by the SHA-256 hex of the key. Aliases are first-class records
//! pointing at a key hash, so human-readable publish paths resolve in
//! one extra lookup.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Persisted stream-key record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamKeyInfo {
    pub user_id: String,
    pub stream_id: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<Vec<IpNet>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Result of key generation. The plaintext key is returned exactly once.
#[derive(Debug, Clone)]
pub struct GeneratedStreamKey {
    pub key: String,
    pub key_hash: String,
    pub alias: Option<String>,
    pub info: StreamKeyInfo,
}

/// A key that passed validation, carrying its storage identity.
#[derive(Debug, Clone)]
pub struct ValidatedKey {
    pub key_hash: String,
    pub info: StreamKeyInfo,
}

/// Durable key-value store contract.
///
/// Values are JSON strings; callers own namespacing.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory store backing tests and single-node development.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: parking_lot::RwLock<std::collections::HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Redis-backed durable store.
pub struct RedisKeyValueStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisKeyValueStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

/// SHA-256 hex of opaque key material.
#[must_use]
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stream-key service: generation, alias resolution, publish validation.
pub struct StreamKeyService {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    key_ttl: Option<Duration>,
}

impl StreamKeyService {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>, key_ttl_hours: Option<u64>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            key_ttl: key_ttl_hours.map(|h| Duration::hours(h as i64)),
        }
    }

    fn key_record(&self, hash: &str) -> String {
        format!("{}:streamkey:{}", self.namespace, hash)
    }

    fn alias_record(&self, alias: &str) -> String {
        format!("{}:alias:{}", self.namespace, alias)
    }

    /// Generate a new stream key, optionally registering an alias.
    pub async fn generate(
        &self,
        user_id: &str,
        stream_id: &str,
        alias: Option<&str>,
        allowed_ips: Option<Vec<IpNet>>,
    ) -> Result<GeneratedStreamKey> {
        let key = nanoid::nanoid!(32);
        let key_hash = hash_key(&key);
        let now = Utc::now();

        let info = StreamKeyInfo {
            user_id: user_id.to_string(),
            stream_id: stream_id.to_string(),
            is_active: true,
            created_at: now,
            expires_at: self.key_ttl.map(|ttl| now + ttl),
            allowed_ips,
            last_used_at: None,
        };

        let record = serde_json::to_string(&info)?;
        self.store.set(&self.key_record(&key_hash), &record).await?;

        if let Some(alias) = alias {
            if alias.is_empty() {
                return Err(Error::InvalidInput("alias must not be empty".to_string()));
            }
            self.store.set(&self.alias_record(alias), &key_hash).await?;
        }

        debug!(stream_id, "generated stream key");
        Ok(GeneratedStreamKey {
            key,
            key_hash,
            alias: alias.map(str::to_string),
            info,
        })
    }

    /// Resolve a path segment (key or alias) to its key hash without
    /// validating. Play paths use this; publishing always validates.
    pub async fn resolve_segment(&self, segment: &str) -> Result<String> {
        let direct_hash = hash_key(segment);
        if self.load(&direct_hash).await?.is_some() {
            return Ok(direct_hash);
        }
        self.store
            .get(&self.alias_record(segment))
            .await?
            .ok_or_else(|| Error::AliasNotFound(segment.to_string()))
    }

    /// Validate a publish attempt. `segment` is the trailing path
    /// component: either the key itself or an alias.
    ///
    /// Re-checks `is_active`, expiry, and the IP allowlist against the
    /// current time in one pass.
    pub async fn validate_publish(&self, segment: &str, remote_ip: Option<IpAddr>) -> Result<ValidatedKey> {
        let direct_hash = hash_key(segment);
        match self.load(&direct_hash).await? {
            Some(info) => self.check(direct_hash, info, remote_ip).await,
            None => {
                let hash = self
                    .store
                    .get(&self.alias_record(segment))
                    .await?
                    .ok_or(Error::KeyNotFound)?;
                let info = self.load(&hash).await?.ok_or(Error::KeyNotFound)?;
                self.check(hash, info, remote_ip).await
            }
        }
    }

    /// Validate a known plaintext key without alias resolution.
    pub async fn validate_key(&self, key: &str, remote_ip: Option<IpAddr>) -> Result<ValidatedKey> {
        let hash = hash_key(key);
        let info = self.load(&hash).await?.ok_or(Error::KeyNotFound)?;
        self.check(hash, info, remote_ip).await
    }

    /// Deactivate a key (kept on record, refuses future publishes).
    pub async fn revoke(&self, key: &str) -> Result<()> {
        let hash = hash_key(key);
        let mut info = self.load(&hash).await?.ok_or(Error::KeyNotFound)?;
        info.is_active = false;
        self.save(&hash, &info).await
    }

    /// Remove a key record entirely.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let hash = hash_key(key);
        self.store.delete(&self.key_record(&hash)).await
    }

    async fn load(&self, hash: &str) -> Result<Option<StreamKeyInfo>> {
        match self.store.get(&self.key_record(hash)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, hash: &str, info: &StreamKeyInfo) -> Result<()> {
        let record = serde_json::to_string(info)?;
        self.store.set(&self.key_record(hash), &record).await
    }

    async fn check(
        &self,
        hash: String,
        mut info: StreamKeyInfo,
        remote_ip: Option<IpAddr>,
    ) -> Result<ValidatedKey> {
        if !info.is_active {
            return Err(Error::KeyInactive);
        }
        let now = Utc::now();
        if let Some(expires_at) = info.expires_at {
            if expires_at <= now {
                return Err(Error::KeyExpired(expires_at));
            }
        }
        if let Some(allowlist) = &info.allowed_ips {
            match remote_ip {
                Some(ip) if allowlist.iter().any(|net| net.contains(&ip)) => {}
                Some(ip) => return Err(Error::IpNotAllowed(ip)),
                None => {
                    warn!("key has an IP allowlist but no remote address was supplied");
                    return Err(Error::KeyNotFound);
                }
            }
        }

        info.last_used_at = Some(now);
        self.save(&hash, &info).await?;
        Ok(ValidatedKey { key_hash: hash, info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> StreamKeyService {
        StreamKeyService::new(Arc::new(MemoryKeyValueStore::new()), "test", Some(24))
    }

    #[tokio::test]
    async fn generated_key_validates() {
        let svc = service();
        let generated = svc.generate("user-1", "stream-1", None, None).await.expect("generate");

        let validated = svc
            .validate_publish(&generated.key, None)
            .await
            .expect("fresh key must validate");
        assert_eq!(validated.key_hash, generated.key_hash);
        assert_eq!(validated.info.user_id, "user-1");
        assert!(validated.info.last_used_at.is_some());
    }

    #[tokio::test]
    async fn alias_resolves_to_key() {
        let svc = service();
        svc.generate("user-1", "stream-1", Some("main-show"), None)
            .await
            .expect("generate");

        let validated = svc
            .validate_publish("main-show", None)
            .await
            .expect("alias must resolve and validate");
        assert_eq!(validated.info.stream_id, "stream-1");

        // Alias and direct-key publishes share one registry identity.
        let resolved = svc.resolve_segment("main-show").await.expect("resolve");
        assert_eq!(resolved, validated.key_hash);
    }

    #[tokio::test]
    async fn unknown_segment_rejected() {
        let svc = service();
        assert!(matches!(
            svc.validate_publish("nope", None).await,
            Err(Error::KeyNotFound)
        ));
    }

    #[tokio::test]
    async fn revoked_key_rejected() {
        let svc = service();
        let generated = svc.generate("user-1", "stream-1", None, None).await.expect("generate");
        svc.revoke(&generated.key).await.expect("revoke");

        assert!(matches!(
            svc.validate_publish(&generated.key, None).await,
            Err(Error::KeyInactive)
        ));
    }

    #[tokio::test]
    async fn expired_key_rejected() {
        let svc = StreamKeyService::new(Arc::new(MemoryKeyValueStore::new()), "test", None);
        let generated = svc.generate("user-1", "stream-1", None, None).await.expect("generate");

        // Backdate expiry directly in the store.
        let hash = hash_key(&generated.key);
        let mut info = generated.info.clone();
        info.expires_at = Some(Utc::now() - Duration::hours(1));
        svc.save(&hash, &info).await.expect("save");

        assert!(matches!(
            svc.validate_publish(&generated.key, None).await,
            Err(Error::KeyExpired(_))
        ));
    }

    #[tokio::test]
    async fn ip_allowlist_enforced() {
        let svc = service();
        let allowlist = vec!["10.0.0.0/8".parse::<IpNet>().expect("net")];
        let generated = svc
            .generate("user-1", "stream-1", None, Some(allowlist))
            .await
            .expect("generate");

        let inside: IpAddr = "10.1.2.3".parse().expect("ip");
        let outside: IpAddr = "192.168.1.1".parse().expect("ip");

        assert!(svc.validate_publish(&generated.key, Some(inside)).await.is_ok());
        assert!(matches!(
            svc.validate_publish(&generated.key, Some(outside)).await,
            Err(Error::IpNotAllowed(_))
        ));
    }

    #[test]
    fn hash_is_stable_and_hex() {
        let a = hash_key("secret");
        let b = hash_key("secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
