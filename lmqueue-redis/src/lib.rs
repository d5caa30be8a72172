//! Redis (or Valkey) state backend for `lmqueue`.
//!
//! Each model key is one hash holding `version` and `state` (JSON). Writes go through a Lua
//! script that compares the stored version before replacing both fields, which is the
//! compare-and-set [`CasQueueStore`](lmqueue::CasQueueStore) needs to share a queue across
//! processes.
//!
//! ```no_run
//! # async fn demo() -> Result<(), lmqueue::StoreError> {
//! use lmqueue::CasQueueStore;
//! use lmqueue_redis::RedisStateBackend;
//!
//! let backend = RedisStateBackend::connect("redis://127.0.0.1/").await?;
//! let store = CasQueueStore::new(backend).with_prefix("prod-llm");
//! # let _ = store;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use lmqueue::store::{ModelState, StateBackend, Versioned};
use lmqueue::StoreError;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::Client;

/// Compare-and-set over the `version` field.
///
/// KEYS[1] = state hash. ARGV = expected version ("" when the key must not exist),
/// next version, state JSON, expiry in milliseconds (0 keeps the key forever).
const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if ARGV[1] == '' then
  if current then return 0 end
elseif current ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'version', ARGV[2], 'state', ARGV[3])
local ttl = tonumber(ARGV[4])
if ttl > 0 then
  redis.call('PEXPIRE', KEYS[1], ttl)
end
return 1
"#;

/// [`StateBackend`] over any async Redis connection.
///
/// Connections are cloned per call; use a multiplexed connection such as
/// [`ConnectionManager`].
#[derive(Clone)]
pub struct RedisStateBackend<C = ConnectionManager> {
    connection: C,
    ttl: Option<Duration>,
}

impl RedisStateBackend<ConnectionManager> {
    /// Open a managed (auto-reconnecting) connection.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(StoreError::backend)?;
        let connection = ConnectionManager::new(client).await.map_err(StoreError::backend)?;
        tracing::debug!(target: "lmqueue::redis", "connected state backend");
        Ok(Self::new(connection))
    }
}

impl<C> RedisStateBackend<C> {
    pub fn new(connection: C) -> Self {
        Self { connection, ttl: None }
    }

    /// Expire a model's state after this long without writes. Every live queue heartbeats
    /// each poll, so only abandoned keys lapse.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl).filter(|ttl| !ttl.is_zero());
        self
    }
}

impl<C> fmt::Debug for RedisStateBackend<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStateBackend")
            .field("connection", &"<redis connection>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

async fn read_state<C: ConnectionLike>(
    conn: &mut C,
    key: &str,
) -> Result<Option<Versioned>, StoreError> {
    let (version, state): (Option<u64>, Option<String>) = redis::cmd("HMGET")
        .arg(key)
        .arg("version")
        .arg("state")
        .query_async(conn)
        .await
        .map_err(StoreError::backend)?;
    match (version, state) {
        (None, None) => Ok(None),
        (Some(version), Some(json)) => {
            let state: ModelState = serde_json::from_str(&json).map_err(StoreError::codec)?;
            Ok(Some(Versioned { version, state }))
        }
        _ => Err(StoreError::Codec(format!("state hash {key} is missing a field"))),
    }
}

async fn write_state<C: ConnectionLike>(
    conn: &mut C,
    key: &str,
    state: &ModelState,
    prev_version: Option<u64>,
    ttl: Option<Duration>,
) -> Result<bool, StoreError> {
    let json = serde_json::to_string(state).map_err(StoreError::codec)?;
    let expected = prev_version.map(|v| v.to_string()).unwrap_or_default();
    let next = prev_version.map_or(1, |v| v.saturating_add(1));
    let ttl_ms = ttl.map_or(0, |ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
    let written: i64 = redis::cmd("EVAL")
        .arg(CAS_SCRIPT)
        .arg(1)
        .arg(key)
        .arg(expected)
        .arg(next)
        .arg(json)
        .arg(ttl_ms)
        .query_async(conn)
        .await
        .map_err(StoreError::backend)?;
    Ok(written == 1)
}

#[async_trait]
impl<C> StateBackend for RedisStateBackend<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn get_state(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let mut conn = self.connection.clone();
        read_state(&mut conn, key).await
    }

    async fn set_state(
        &self,
        key: &str,
        state: &ModelState,
        prev_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let written = write_state(&mut conn, key, state, prev_version, self.ttl).await?;
        if !written {
            tracing::trace!(target: "lmqueue::redis", key, ?prev_version, "version moved under us");
        }
        Ok(written)
    }
}
