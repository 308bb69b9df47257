//! Durable session registry: primary record plus two ordered indices
//! (`lastActivity`, `expiresAt`), backed by Valkey (§4.3).

use chrono::{DateTime, Utc};
use fred::interfaces::{KeysInterface, SortedSetsInterface};
use fred::types::Expiration;
use serde::{Deserialize, Serialize};

const KEY_PREFIX: &str = "agentland:session:";
const LAST_ACTIVITY_KEY: &str = "agentland:last-activity";
const EXPIRES_AT_KEY: &str = "agentland:expires-at";

fn session_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

/// Authoritative session record shape (§9 open question resolution: of the
/// two competing structs in the original implementation, this one wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub sandbox_id: String,
    pub grpc_endpoint: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session not found")]
    NotFound,
    #[error("expiresAt must be in the future")]
    InvalidExpiry,
    #[error(transparent)]
    Backend(#[from] fred::error::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Session registry backed by a Valkey/Redis connection pool.
#[derive(Clone)]
pub struct SessionRegistry {
    pool: fred::clients::Pool,
}

impl SessionRegistry {
    pub async fn connect(url: &str) -> Result<Self, RegistryError> {
        let config = fred::types::config::Config::from_url(url)?;
        let pool = fred::clients::Pool::new(config, None, None, None, 4)?;
        pool.init().await?;
        tracing::info!("connected to valkey");
        Ok(Self { pool })
    }

    /// Atomically writes the primary record (with TTL) and both index
    /// members. All three writes must land or the call fails (§4.3).
    #[tracing::instrument(skip(self, info), fields(sandbox_id = %info.sandbox_id), err)]
    pub async fn create_session(&self, info: &SessionInfo) -> Result<(), RegistryError> {
        let now = Utc::now();
        if info.expires_at <= now {
            return Err(RegistryError::InvalidExpiry);
        }
        let ttl_secs = (info.expires_at - now).num_seconds().max(1);
        let value = serde_json::to_string(info)?;
        let key = session_key(&info.sandbox_id);

        let pipeline = self.pool.next().pipeline();
        let _: () = pipeline
            .set(&key, value, Some(Expiration::EX(ttl_secs)), None, false)
            .await?;
        let _: () = pipeline
            .zadd(
                LAST_ACTIVITY_KEY,
                None,
                None,
                false,
                false,
                (now.timestamp() as f64, info.sandbox_id.clone()),
            )
            .await?;
        let _: () = pipeline
            .zadd(
                EXPIRES_AT_KEY,
                None,
                None,
                false,
                false,
                (info.expires_at.timestamp() as f64, info.sandbox_id.clone()),
            )
            .await?;
        let _: () = pipeline.all().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_session(&self, id: &str) -> Result<SessionInfo, RegistryError> {
        let raw: Option<String> = self.pool.get(session_key(id)).await?;
        let raw = raw.ok_or(RegistryError::NotFound)?;
        Ok(serde_json::from_str(&raw)?)
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn update_latest_activity(&self, id: &str) -> Result<(), RegistryError> {
        let exists: bool = self.pool.exists(session_key(id)).await?;
        if !exists {
            return Err(RegistryError::NotFound);
        }
        let now = Utc::now().timestamp() as f64;
        let _: () = self
            .pool
            .zadd(LAST_ACTIVITY_KEY, None, None, false, false, (now, id))
            .await?;
        Ok(())
    }

    /// Removes the primary record and both index members. Idempotent.
    #[tracing::instrument(skip(self), err)]
    pub async fn delete_session(&self, id: &str) -> Result<(), RegistryError> {
        let pipeline = self.pool.next().pipeline();
        let _: () = pipeline.del(session_key(id)).await?;
        let _: () = pipeline.zrem(LAST_ACTIVITY_KEY, id).await?;
        let _: () = pipeline.zrem(EXPIRES_AT_KEY, id).await?;
        let _: () = pipeline.all().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn list_inactive_sessions(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, RegistryError> {
        self.list_by_score(LAST_ACTIVITY_KEY, before, limit).await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn list_expired_sessions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, RegistryError> {
        self.list_by_score(EXPIRES_AT_KEY, now, limit).await
    }

    async fn list_by_score(
        &self,
        index_key: &str,
        max: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, RegistryError> {
        let ids: Vec<String> = self
            .pool
            .zrangebyscore(index_key, "-inf", max.timestamp() as f64, Some((0, limit)))
            .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn sample_info() -> SessionInfo {
        SessionInfo {
            sandbox_id: "sess-1".to_owned(),
            grpc_endpoint: "10.42.0.10:1883".to_owned(),
            created_at: Utc::now(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        }
    }

    #[test]
    fn session_info_round_trips_through_json() {
        let info = sample_info();
        let json = serde_json::to_string(&info).unwrap();
        let back: SessionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn session_key_uses_fixed_prefix() {
        assert_eq!(session_key("sess-1"), "agentland:session:sess-1");
    }

    #[test]
    fn session_info_serializes_camel_case_fields() {
        let info = sample_info();
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("sandboxId").is_some());
        assert!(json.get("grpcEndpoint").is_some());
    }
}
