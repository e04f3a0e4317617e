//! Coordination store on a Redis server, shared by every process of a fleet.
//!
//! Plain primitives map to single commands. Atomic batches run as one Lua
//! script that checks the guard and the value types of every touched key
//! before writing anything. Keys are passed inside the script arguments, so
//! this targets a standalone server rather than a cluster.
//!
//! [`CoordinationStore::list_pop_front_then`] cannot run the follow-up
//! closure on the server. It reads the head, builds the follow-up ops from
//! it, and commits `LPOP` plus those ops in one script guarded on the head
//! being unchanged, retrying when another client got there first.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, Script};

use super::{CoordinationStore, FollowUp, Guard, Key, StoreOp};
use crate::error::{FleetError, Result};

/// Optimistic pop attempts before giving up on a contended list.
const MAX_POP_ATTEMPTS: usize = 64;

const ATOMIC_SCRIPT: &str = r#"
local guard = cjson.decode(ARGV[1])
local ops = cjson.decode(ARGV[2])

local kind = guard[1]
if kind == 'hash_eq' then
  if redis.call('HGET', guard[2], guard[3]) ~= guard[4] then return 0 end
elseif kind == 'hash_absent' then
  if redis.call('HEXISTS', guard[2], guard[3]) == 1 then return 0 end
elseif kind == 'list_empty' then
  if redis.call('LLEN', guard[2]) ~= 0 then return 0 end
elseif kind == 'list_head' then
  if redis.call('LINDEX', guard[2], 0) ~= guard[3] then return 0 end
end

for _, op in ipairs(ops) do
  local want = op[1]
  if want ~= 'any' then
    local held = redis.call('TYPE', op[3])['ok']
    if held ~= 'none' and held ~= want then
      return redis.error_reply('WRONGTYPE key ' .. op[3] .. ' holds ' .. held .. ', expected ' .. want)
    end
  end
end

for _, op in ipairs(ops) do
  redis.call(unpack(op, 2))
end
return 1
"#;

const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

fn store_err(e: redis::RedisError) -> FleetError {
    FleetError::Store(e.to_string())
}

fn millis(d: Duration) -> u64 {
    (d.as_millis() as u64).max(1)
}

/// `[expected type, command, key, args...]` as the batch script reads it.
fn encode_op(op: &StoreOp) -> Vec<String> {
    let row = |kind: &str, cmd: &str, key: &Key, args: &[&str]| {
        let mut row = vec![kind.to_string(), cmd.to_string(), key.render()];
        row.extend(args.iter().map(|a| a.to_string()));
        row
    };
    match op {
        StoreOp::PushBack { list, value } => row("list", "RPUSH", list, &[value]),
        StoreOp::PushFront { list, value } => row("list", "LPUSH", list, &[value]),
        StoreOp::ListRemove { list, value } => row("list", "LREM", list, &["0", value]),
        StoreOp::SetAdd { set, member } => row("set", "SADD", set, &[member]),
        StoreOp::SetRemove { set, member } => row("set", "SREM", set, &[member]),
        StoreOp::HashSet { hash, field, value } => row("hash", "HSET", hash, &[field, value]),
        StoreOp::HashDelete { hash, field } => row("hash", "HDEL", hash, &[field]),
        StoreOp::HashIncr { hash, field, by } => {
            row("hash", "HINCRBY", hash, &[field, &by.to_string()])
        }
        StoreOp::Delete { key } => row("any", "DEL", key, &[]),
    }
}

fn encode_guard(guard: Option<&Guard>) -> Vec<String> {
    match guard {
        None => Vec::new(),
        Some(Guard::HashFieldEquals { hash, field, value }) => vec![
            "hash_eq".to_string(),
            hash.render(),
            field.clone(),
            value.clone(),
        ],
        Some(Guard::HashFieldAbsent { hash, field }) => {
            vec!["hash_absent".to_string(), hash.render(), field.clone()]
        }
        Some(Guard::ListEmpty { list }) => vec!["list_empty".to_string(), list.render()],
    }
}

fn head_guard(list: &Key, head: &str) -> Vec<String> {
    vec!["list_head".to_string(), list.render(), head.to_string()]
}

/// Coordination store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    batch: Script,
    unlock: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url` (`redis://host:port/db` or `rediss://…`). The
    /// connection reconnects on its own after transient failures.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = ConnectionManager::new(client).await.map_err(store_err)?;
        tracing::info!("Connected to Redis coordination store");
        Ok(Self {
            conn,
            batch: Script::new(ATOMIC_SCRIPT),
            unlock: Script::new(UNLOCK_SCRIPT),
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &mut redis::Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(store_err)
    }

    async fn run_batch(&self, guard: Vec<String>, ops: Vec<Vec<String>>) -> Result<bool> {
        let guard = serde_json::to_string(&guard)?;
        let ops = serde_json::to_string(&ops)?;
        let mut conn = self.conn.clone();
        let mut invocation = self.batch.prepare_invoke();
        invocation.arg(guard).arg(ops);
        let applied: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(applied == 1)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn list_push_back(&self, list: &Key, value: &str) -> Result<usize> {
        self.query(redis::cmd("RPUSH").arg(list.render()).arg(value))
            .await
    }

    async fn list_push_front(&self, list: &Key, value: &str) -> Result<usize> {
        self.query(redis::cmd("LPUSH").arg(list.render()).arg(value))
            .await
    }

    async fn list_pop_front(&self, list: &Key) -> Result<Option<String>> {
        self.query(redis::cmd("LPOP").arg(list.render())).await
    }

    async fn list_pop_front_then(
        &self,
        list: &Key,
        follow_up: FollowUp,
    ) -> Result<Option<String>> {
        let key = list.render();
        for _ in 0..MAX_POP_ATTEMPTS {
            let head: Option<String> = self.query(redis::cmd("LINDEX").arg(&key).arg(0)).await?;
            let Some(head) = head else {
                return Ok(None);
            };

            let mut ops = vec![vec!["list".to_string(), "LPOP".to_string(), key.clone()]];
            ops.extend(follow_up(&head).iter().map(encode_op));
            if self.run_batch(head_guard(list, &head), ops).await? {
                return Ok(Some(head));
            }
            tracing::debug!(list = %key, "List head changed before pop, retrying");
        }
        Err(FleetError::Store(format!(
            "gave up popping {key} after {MAX_POP_ATTEMPTS} contended attempts"
        )))
    }

    async fn list_remove(&self, list: &Key, value: &str) -> Result<usize> {
        self.query(redis::cmd("LREM").arg(list.render()).arg(0).arg(value))
            .await
    }

    async fn list_len(&self, list: &Key) -> Result<usize> {
        self.query(redis::cmd("LLEN").arg(list.render())).await
    }

    async fn list_range(&self, list: &Key, limit: Option<usize>) -> Result<Vec<String>> {
        let stop = match limit {
            Some(0) => return Ok(Vec::new()),
            Some(n) => n as i64 - 1,
            None => -1,
        };
        self.query(redis::cmd("LRANGE").arg(list.render()).arg(0).arg(stop))
            .await
    }

    async fn list_trim(&self, list: &Key, keep: usize) -> Result<()> {
        if keep == 0 {
            let _: usize = self.query(redis::cmd("DEL").arg(list.render())).await?;
            return Ok(());
        }
        self.query(
            redis::cmd("LTRIM")
                .arg(list.render())
                .arg(0)
                .arg(keep as i64 - 1),
        )
        .await
    }

    async fn set_add(&self, set: &Key, member: &str) -> Result<bool> {
        let added: usize = self
            .query(redis::cmd("SADD").arg(set.render()).arg(member))
            .await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, set: &Key, member: &str) -> Result<bool> {
        let removed: usize = self
            .query(redis::cmd("SREM").arg(set.render()).arg(member))
            .await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, set: &Key) -> Result<Vec<String>> {
        let mut members: Vec<String> = self.query(redis::cmd("SMEMBERS").arg(set.render())).await?;
        members.sort();
        Ok(members)
    }

    async fn set_contains(&self, set: &Key, member: &str) -> Result<bool> {
        self.query(redis::cmd("SISMEMBER").arg(set.render()).arg(member))
            .await
    }

    async fn hash_set(&self, hash: &Key, field: &str, value: &str) -> Result<()> {
        let _: usize = self
            .query(redis::cmd("HSET").arg(hash.render()).arg(field).arg(value))
            .await?;
        Ok(())
    }

    async fn hash_get(&self, hash: &Key, field: &str) -> Result<Option<String>> {
        self.query(redis::cmd("HGET").arg(hash.render()).arg(field))
            .await
    }

    async fn hash_delete(&self, hash: &Key, field: &str) -> Result<bool> {
        let removed: usize = self
            .query(redis::cmd("HDEL").arg(hash.render()).arg(field))
            .await?;
        Ok(removed > 0)
    }

    async fn hash_get_all(&self, hash: &Key) -> Result<BTreeMap<String, String>> {
        self.query(redis::cmd("HGETALL").arg(hash.render())).await
    }

    async fn put(&self, key: &Key, value: &str) -> Result<()> {
        self.query(redis::cmd("SET").arg(key.render()).arg(value))
            .await
    }

    async fn put_ex(&self, key: &Key, value: &str, ttl: Duration) -> Result<()> {
        self.query(
            redis::cmd("SET")
                .arg(key.render())
                .arg(value)
                .arg("PX")
                .arg(millis(ttl)),
        )
        .await
    }

    async fn get(&self, key: &Key) -> Result<Option<String>> {
        self.query(redis::cmd("GET").arg(key.render())).await
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        let count: usize = self.query(redis::cmd("EXISTS").arg(key.render())).await?;
        Ok(count > 0)
    }

    async fn delete(&self, key: &Key) -> Result<bool> {
        let count: usize = self.query(redis::cmd("DEL").arg(key.render())).await?;
        Ok(count > 0)
    }

    async fn try_lock(&self, key: &Key, token: &str, lease: Duration) -> Result<bool> {
        let reply: Option<String> = self
            .query(
                redis::cmd("SET")
                    .arg(key.render())
                    .arg(token)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(lease)),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &Key, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.unlock.prepare_invoke();
        invocation.key(key.render()).arg(token);
        let released: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(released == 1)
    }

    async fn atomic(&self, guard: Option<Guard>, ops: Vec<StoreOp>) -> Result<bool> {
        let ops = ops.iter().map(encode_op).collect();
        self.run_batch(encode_guard(guard.as_ref()), ops).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{TenantId, WorkerName};

    fn tenant() -> TenantId {
        TenantId::new("acme").unwrap()
    }

    #[test]
    fn ops_carry_their_expected_type() {
        let rows: Vec<Vec<String>> = [
            StoreOp::PushBack {
                list: Key::Queue(tenant()),
                value: "a.png".to_string(),
            },
            StoreOp::ListRemove {
                list: Key::Queue(tenant()),
                value: "a.png".to_string(),
            },
            StoreOp::HashIncr {
                hash: Key::Retries(tenant()),
                field: "a.png".to_string(),
                by: 1,
            },
            StoreOp::Delete {
                key: Key::Heartbeat(WorkerName::new("w1").unwrap()),
            },
        ]
        .iter()
        .map(encode_op)
        .collect();

        assert_eq!(rows[0], ["list", "RPUSH", "tenant:acme:queue", "a.png"]);
        assert_eq!(rows[1], ["list", "LREM", "tenant:acme:queue", "0", "a.png"]);
        assert_eq!(rows[2], ["hash", "HINCRBY", "tenant:acme:retries", "a.png", "1"]);
        assert_eq!(rows[3], ["any", "DEL", "worker:w1:heartbeat"]);
    }

    #[test]
    fn guards_encode_for_the_batch_script() {
        assert!(encode_guard(None).is_empty());
        let guard = Guard::HashFieldEquals {
            hash: Key::ProcessingRecords(tenant()),
            field: "a.png".to_string(),
            value: "{}".to_string(),
        };
        assert_eq!(
            encode_guard(Some(&guard)),
            ["hash_eq", "tenant:acme:processing_records", "a.png", "{}"]
        );
        assert_eq!(
            head_guard(&Key::Queue(tenant()), "a.png"),
            ["list_head", "tenant:acme:queue", "a.png"]
        );
    }

    /// Runs against a live server when `REDIS_URL` is set.
    #[tokio::test]
    #[ignore]
    async fn claim_pattern_against_live_server() {
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let store = RedisStore::connect(&url).await.unwrap();
        let tenant = TenantId::new(format!("it-{}", uuid::Uuid::new_v4().simple())).unwrap();
        let queue = Key::Queue(tenant.clone());
        let processing = Key::Processing(tenant);

        store.list_push_back(&queue, "a.png").await.unwrap();
        let set = processing.clone();
        let popped = store
            .list_pop_front_then(
                &queue,
                Box::new(move |value| {
                    vec![StoreOp::SetAdd {
                        set: set.clone(),
                        member: value.to_string(),
                    }]
                }),
            )
            .await
            .unwrap();
        assert_eq!(popped.as_deref(), Some("a.png"));
        assert!(store.set_contains(&processing, "a.png").await.unwrap());
        assert_eq!(store.list_len(&queue).await.unwrap(), 0);

        let lock = Key::ArtifactLock(TenantId::new("it-lock").unwrap());
        assert!(store.try_lock(&lock, "t1", Duration::from_secs(5)).await.unwrap());
        assert!(!store.try_lock(&lock, "t2", Duration::from_secs(5)).await.unwrap());
        assert!(!store.unlock(&lock, "t2").await.unwrap());
        assert!(store.unlock(&lock, "t1").await.unwrap());

        store.delete(&processing).await.unwrap();
    }
}
