//! Redis-backed lock service (`redis` feature).
//!
//! - **Acquire**: `SET key record NX PX ttl`; Redis expiry does the lazy reclaim
//! - **Release / renew**: Lua scripts that compare the stored token first, so a
//!   stale holder can never delete or extend someone else's lock
//!
//! The stored value is the JSON-encoded [`LockRecord`].

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Script};
use tracing::instrument;

use forgeq_core::{
    DatabaseError, LockAcquisitionError, LockToken, SharedClock, SystemClock,
};

use super::{LockRecord, LockService, expiry_for, ttl_millis};

const DEFAULT_KEY_PREFIX: &str = "forgeq:lock:";

const RELEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current and cjson.decode(current).token == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const RENEW_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current and cjson.decode(current).token == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[2])
    return 1
end
return 0
"#;

#[derive(Clone)]
pub struct RedisLockService {
    conn: MultiplexedConnection,
    prefix: String,
    clock: SharedClock,
    release_script: Arc<Script>,
    renew_script: Arc<Script>,
}

impl RedisLockService {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self, DatabaseError> {
        let client = Client::open(redis_url).map_err(|e| redis_error("redis_connect", e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| redis_error("redis_connect", e))?;
        Ok(Self {
            conn,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            clock: Arc::new(SystemClock),
            release_script: Arc::new(Script::new(RELEASE_SCRIPT)),
            renew_script: Arc::new(Script::new(RENEW_SCRIPT)),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn load(&self, key: &str) -> Result<Option<LockRecord>, LockAcquisitionError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = ::redis::cmd("GET")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockAcquisitionError::new(key, redis_error("redis_get", e)))?;

        raw.map(|raw| {
            serde_json::from_str::<LockRecord>(&raw).map_err(|e| {
                LockAcquisitionError::new(
                    key,
                    DatabaseError::corrupt(format!("lock record for `{key}`: {e}")),
                )
            })
        })
        .transpose()
    }
}

impl core::fmt::Debug for RedisLockService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisLockService")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl LockService for RedisLockService {
    #[instrument(skip(self), err)]
    async fn acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockToken, LockAcquisitionError> {
        let now = self.clock.now();
        let expires_at = expiry_for(key, now, ttl)?;
        let record = LockRecord {
            key: key.to_string(),
            holder: holder.to_string(),
            token: LockToken::new(),
            acquired_at: now,
            expires_at,
        };
        let value = serde_json::to_string(&record).map_err(|e| {
            LockAcquisitionError::new(key, DatabaseError::corrupt(e.to_string()))
        })?;

        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockAcquisitionError::new(key, redis_error("redis_acquire", e)))?;

        if reply.is_some() {
            return Ok(record.token);
        }
        match self.load(key).await? {
            Some(current) => Err(LockAcquisitionError::held(
                key,
                current.holder,
                current.expires_at,
            )),
            None => Err(LockAcquisitionError::new(
                key,
                DatabaseError::conflict("lock changed hands during acquisition"),
            )),
        }
    }

    #[instrument(skip(self), err)]
    async fn release(&self, key: &str, token: LockToken) -> Result<(), LockAcquisitionError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.release_script.key(self.redis_key(key));
        invocation.arg(token.to_string());
        let _deleted: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockAcquisitionError::new(key, redis_error("redis_release", e)))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn renew(
        &self,
        key: &str,
        token: LockToken,
        ttl: Duration,
    ) -> Result<(), LockAcquisitionError> {
        let expires_at = expiry_for(key, self.clock.now(), ttl)?;
        let Some(mut record) = self.load(key).await? else {
            return Err(LockAcquisitionError::stale(key));
        };
        if record.token != token {
            return Err(LockAcquisitionError::stale(key));
        }
        record.expires_at = expires_at;
        let value = serde_json::to_string(&record).map_err(|e| {
            LockAcquisitionError::new(key, DatabaseError::corrupt(e.to_string()))
        })?;

        let mut conn = self.conn.clone();
        let mut invocation = self.renew_script.key(self.redis_key(key));
        invocation
            .arg(token.to_string())
            .arg(ttl_millis(ttl))
            .arg(value);
        let renewed: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockAcquisitionError::new(key, redis_error("redis_renew", e)))?;

        if renewed == 0 {
            return Err(LockAcquisitionError::stale(key));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn inspect(&self, key: &str) -> Result<Option<LockRecord>, LockAcquisitionError> {
        let now = self.clock.now();
        Ok(self.load(key).await?.filter(|record| !record.is_expired(now)))
    }
}

fn redis_error(operation: &str, err: ::redis::RedisError) -> DatabaseError {
    DatabaseError::unavailable(operation, err.to_string())
}
