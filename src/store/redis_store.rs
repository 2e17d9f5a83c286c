use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use crate::error::Result;
use crate::scheduler::job::fields;
use crate::store::{ActiveChange, ClaimAttempt, JobStore, StoreKeys};

/// Compare-and-set on the status field plus the matching active-set change.
///
/// KEYS: job hash, active set.
/// ARGV: status field, expected status, active op, job id, then field/value pairs.
const TRANSITION_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if current ~= ARGV[2] then
  return 0
end
for i = 5, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
if ARGV[3] == 'add' then
  redis.call('SADD', KEYS[2], ARGV[4])
elseif ARGV[3] == 'remove' then
  redis.call('SREM', KEYS[2], ARGV[4])
end
return 1
"#;

/// Pop the queue head and claim it if its status matches.
///
/// KEYS: queue list, active set.
/// ARGV: job key prefix, status field, expected status, then field/value pairs.
/// Returns `{0, ''}` when empty, `{1, id}` when claimed, `{2, id}` when discarded.
const CLAIM_SCRIPT: &str = r#"
local id = redis.call('LPOP', KEYS[1])
if not id then
  return {0, ''}
end
local key = ARGV[1] .. id
if redis.call('HGET', key, ARGV[2]) ~= ARGV[3] then
  return {2, id}
end
for i = 4, #ARGV, 2 do
  redis.call('HSET', key, ARGV[i], ARGV[i + 1])
end
redis.call('SADD', KEYS[2], id)
return {1, id}
"#;

/// Remove a job from the queue list and rewrite its status, only if both the status
/// matches and the id is still listed.
///
/// KEYS: job hash, queue list.
/// ARGV: status field, expected status, job id, then field/value pairs.
const DEQUEUE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
  return 0
end
if redis.call('LREM', KEYS[2], 1, ARGV[3]) == 0 then
  return 0
end
for i = 4, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
return 1
"#;

/// How often an idle worker re-runs the claim script.
const CLAIM_POLL: Duration = Duration::from_millis(100);

/// Job store backed by a Redis server shared by the web process and all workers.
///
/// Commands go through a reconnecting [`ConnectionManager`]. Every multi-key change
/// is a Lua script or a MULTI pipeline, so it is applied as one step on the server.
/// Claims are polled rather than blocking, because a script cannot block on a list.
pub struct RedisStore {
    conn: ConnectionManager,
    keys: StoreKeys,
    transition: Script,
    claim: Script,
    dequeue: Script,
}

impl RedisStore {
    pub async fn connect(url: &str, keys: StoreKeys) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let store = Self {
            conn,
            keys,
            transition: Script::new(TRANSITION_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            dequeue: Script::new(DEQUEUE_SCRIPT),
        };
        store.ping().await?;
        tracing::info!(url, queue = %store.keys.queue(), "Connected to job store");
        Ok(store)
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn enqueue(&self, job_id: &str, updates: &[(&str, String)]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(self.keys.job(job_id), updates)
            .ignore()
            .rpush(self.keys.queue(), job_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_record(&self, job_id: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let record: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job(job_id))
            .query_async(&mut conn)
            .await?;
        Ok(record)
    }

    async fn transition(
        &self,
        job_id: &str,
        expected_status: &str,
        updates: &[(&str, String)],
        active: ActiveChange,
    ) -> Result<bool> {
        let op = match active {
            ActiveChange::Keep => "keep",
            ActiveChange::Add => "add",
            ActiveChange::Remove => "remove",
        };

        let mut invocation = self.transition.prepare_invoke();
        invocation
            .key(self.keys.job(job_id))
            .key(self.keys.active())
            .arg(fields::STATUS)
            .arg(expected_status)
            .arg(op)
            .arg(job_id);
        for (name, value) in updates {
            invocation.arg(*name).arg(value);
        }

        let mut conn = self.conn.clone();
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    async fn claim_head(
        &self,
        expected_status: &str,
        updates: &[(&str, String)],
    ) -> Result<ClaimAttempt> {
        let mut invocation = self.claim.prepare_invoke();
        invocation
            .key(self.keys.queue())
            .key(self.keys.active())
            .arg(self.keys.job(""))
            .arg(fields::STATUS)
            .arg(expected_status);
        for (name, value) in updates {
            invocation.arg(*name).arg(value);
        }

        let mut conn = self.conn.clone();
        let (code, job_id): (i64, String) = invocation.invoke_async(&mut conn).await?;
        Ok(match code {
            1 => ClaimAttempt::Claimed(job_id),
            2 => ClaimAttempt::Discarded(job_id),
            _ => ClaimAttempt::Empty,
        })
    }

    async fn wait_for_work(&self, timeout: Duration) -> Result<()> {
        tokio::time::sleep(timeout.min(CLAIM_POLL)).await;
        Ok(())
    }

    async fn dequeue(
        &self,
        job_id: &str,
        expected_status: &str,
        updates: &[(&str, String)],
    ) -> Result<bool> {
        let mut invocation = self.dequeue.prepare_invoke();
        invocation
            .key(self.keys.job(job_id))
            .key(self.keys.queue())
            .arg(fields::STATUS)
            .arg(expected_status)
            .arg(job_id);
        for (name, value) in updates {
            invocation.arg(*name).arg(value);
        }

        let mut conn = self.conn.clone();
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    async fn queued_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.queue())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn active_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.active())
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }

    async fn remove_active(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("SREM")
            .arg(self.keys.active())
            .arg(job_id)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}
