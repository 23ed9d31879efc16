use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::info;

use super::kv::{rank_top, KvStore};

/// Adds ARGV[1] to set KEYS[1] unless it already holds ARGV[2] members.
const SADD_BOUNDED: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then return 1 end
if redis.call('SCARD', KEYS[1]) >= tonumber(ARGV[2]) then return 0 end
redis.call('SADD', KEYS[1], ARGV[1])
return 1
"#;

/// Members of KEYS[1] scoring at least the score at 0-based rank ARGV[1], so
/// ties straddling the cutoff all come back and can be ordered by member.
const ZTOP_WITH_TIES: &str = r#"
local nth = redis.call('ZREVRANGE', KEYS[1], ARGV[1], ARGV[1], 'WITHSCORES')
if #nth == 0 then
  return redis.call('ZREVRANGE', KEYS[1], 0, -1, 'WITHSCORES')
end
return redis.call('ZREVRANGEBYSCORE', KEYS[1], '+inf', nth[2], 'WITHSCORES')
"#;

/// Redis-backed store. The connection manager reconnects on its own and is
/// cheap to clone per call.
#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
    sadd_bounded: Script,
    ztop: Script,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!("Connected to Redis");
        Ok(Self {
            conn,
            sadd_bounded: Script::new(SADD_BOUNDED),
            ztop: Script::new(ZTOP_WITH_TIES),
        })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                conn.set_ex::<_, _, ()>(key, value.as_ref(), secs).await?
            }
            None => conn.set::<_, _, ()>(key, value.as_ref()).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn zincr(&self, key: &str, member: &str, by: f64) -> Result<f64> {
        let mut conn = self.conn.clone();
        Ok(conn.zincr(key, member, by).await?)
    }

    async fn ztop(&self, key: &str, n: usize) -> Result<Vec<(String, f64)>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let last = i64::try_from(n - 1).unwrap_or(i64::MAX);
        let mut ranked: Vec<(String, f64)> = self
            .ztop
            .key(key)
            .arg(last)
            .invoke_async(&mut conn)
            .await?;
        rank_top(&mut ranked, n);
        Ok(ranked)
    }

    async fn sadd_bounded(&self, key: &str, member: &str, max_len: usize) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = self
            .sadd_bounded
            .key(key)
            .arg(member)
            .arg(max_len)
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = conn.smembers(key).await?;
        members.sort();
        Ok(members)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
