use std::{collections::HashMap, fmt, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{debug, info, warn};

use crate::{
    error::{CaptureError, Result},
    request::CaptureRequest,
    results::ResultRecord,
};

use super::{
    DequeueRequest, EnqueueOptions, JobHandle, JobId, JobLease, JobQueue,
    JobRecord, JobState, LeaseId, LeaseRenewal, QueueCounts, QueueSettings,
    STALLED_FAILURE_REASON, StalledScan,
};

/// Lua scripts for atomic queue transitions.
///
/// Each job lives in a hash at `{prefix}:job:{id}`. Waiting ids sit in the
/// `{prefix}:wait` list, active ids in the `{prefix}:active` sorted set
/// scored by lock expiry (ms), and lifetime totals in `{prefix}:stats`.
mod scripts {
    use once_cell::sync::Lazy;
    use redis::Script;

    const HELPERS: &str = r#"
        local function holds(key, token)
            return redis.call('HGET', key, 'state') == 'active'
                and redis.call('HGET', key, 'lock_token') == token
        end

        local function release(key, active, id)
            redis.call('ZREM', active, id)
            redis.call('HDEL', key, 'lock_token', 'lock_owner', 'lock_expires')
        end

        local function finish(key, active, stats, id, state, now)
            release(key, active, id)
            redis.call('HSET', key, 'state', state, 'finished_at', now)
            redis.call('HINCRBY', stats, state, 1)
            local grace = tonumber(redis.call('HGET', key, 'remove_after') or '-1')
            if grace >= 0 then
                redis.call('PEXPIRE', key, math.max(grace, 1))
            end
        end
    "#;

    fn with_helpers(body: &str) -> Script {
        Script::new(&format!("{HELPERS}\n{body}"))
    }

    pub static ADD: Lazy<Script> = Lazy::new(|| {
        Script::new(
            r#"
            local existing = redis.call('HGET', KEYS[1], 'state')
            if existing then
                return {0, existing}
            end
            redis.call('HSET', KEYS[1],
                'state', 'waiting',
                'payload', ARGV[2],
                'attempts', 0,
                'max_attempts', ARGV[3],
                'stalled', 0,
                'renewals', 0,
                'created_at', ARGV[4],
                'remove_after', ARGV[5])
            redis.call('RPUSH', KEYS[2], ARGV[1])
            return {1, 'waiting'}
            "#,
        )
    });

    pub static DEQUEUE: Lazy<Script> = Lazy::new(|| {
        Script::new(
            r#"
            while true do
                local id = redis.call('LPOP', KEYS[1])
                if not id then
                    return false
                end
                local key = ARGV[1] .. id
                if redis.call('HGET', key, 'state') == 'waiting' then
                    local expires = tonumber(ARGV[4]) + tonumber(ARGV[5])
                    redis.call('HSET', key,
                        'state', 'active',
                        'lock_token', ARGV[2],
                        'lock_owner', ARGV[3],
                        'lock_expires', expires,
                        'renewals', 0)
                    redis.call('HINCRBY', key, 'attempts', 1)
                    redis.call('ZADD', KEYS[2], expires, id)
                    return id
                end
            end
            "#,
        )
    });

    pub static RENEW: Lazy<Script> = Lazy::new(|| {
        with_helpers(
            r#"
            if redis.call('EXISTS', KEYS[1]) == 0 then
                return -2
            end
            if not holds(KEYS[1], ARGV[2]) then
                return -1
            end
            local expires = tonumber(ARGV[3]) + tonumber(ARGV[4])
            redis.call('HSET', KEYS[1], 'lock_expires', expires)
            redis.call('HINCRBY', KEYS[1], 'renewals', 1)
            redis.call('ZADD', KEYS[2], expires, ARGV[1])
            return expires
            "#,
        )
    });

    pub static COMPLETE: Lazy<Script> = Lazy::new(|| {
        with_helpers(
            r#"
            if not holds(KEYS[1], ARGV[2]) then
                return -1
            end
            redis.call('HSET', KEYS[1], 'result', ARGV[3])
            finish(KEYS[1], KEYS[2], KEYS[3], ARGV[1], 'completed', ARGV[4])
            return 1
            "#,
        )
    });

    pub static FAIL: Lazy<Script> = Lazy::new(|| {
        with_helpers(
            r#"
            if not holds(KEYS[1], ARGV[2]) then
                return 'lost'
            end
            redis.call('HSET', KEYS[1], 'failed_reason', ARGV[3])
            local attempts = tonumber(redis.call('HGET', KEYS[1], 'attempts') or '0')
            local max_attempts = tonumber(redis.call('HGET', KEYS[1], 'max_attempts') or '1')
            if ARGV[5] == '1' and attempts < max_attempts then
                release(KEYS[1], KEYS[2], ARGV[1])
                redis.call('HSET', KEYS[1], 'state', 'waiting')
                redis.call('RPUSH', KEYS[4], ARGV[1])
                return 'waiting'
            end
            finish(KEYS[1], KEYS[2], KEYS[3], ARGV[1], 'failed', ARGV[4])
            return 'failed'
            "#,
        )
    });

    pub static SCAN_STALLED: Lazy<Script> = Lazy::new(|| {
        with_helpers(
            r#"
            local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
            local recovered, failed = {}, {}
            for _, id in ipairs(ids) do
                local key = ARGV[1] .. id
                if redis.call('HGET', key, 'state') == 'active' then
                    local stalled = redis.call('HINCRBY', key, 'stalled', 1)
                    if stalled > tonumber(ARGV[3]) then
                        redis.call('HSET', key, 'failed_reason', ARGV[4])
                        finish(key, KEYS[1], KEYS[3], id, 'failed', ARGV[2])
                        table.insert(failed, id)
                    else
                        release(key, KEYS[1], id)
                        redis.call('HSET', key, 'state', 'waiting')
                        redis.call('RPUSH', KEYS[2], id)
                        table.insert(recovered, id)
                    end
                else
                    redis.call('ZREM', KEYS[1], id)
                end
            end
            return {recovered, failed}
            "#,
        )
    });
}

/// Shared queue backed by Redis. Safe to use from many worker processes.
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
    settings: QueueSettings,
}

impl fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("connection", &"ConnectionManager")
            .field("settings", &self.settings)
            .finish()
    }
}

impl RedisJobQueue {
    pub fn new(conn: ConnectionManager, settings: QueueSettings) -> Self {
        info!(prefix = %settings.prefix, "using redis job queue");
        Self { conn, settings }
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.settings.prefix)
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}{}", self.job_prefix(), id)
    }

    fn wait_key(&self) -> String {
        format!("{}:wait", self.settings.prefix)
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.settings.prefix)
    }

    fn stats_key(&self) -> String {
        format!("{}:stats", self.settings.prefix)
    }

    async fn load(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_record(id, &fields).map(Some)
    }

    async fn load_lease(&self, id: &JobId, lease_id: LeaseId, owner: String) -> Result<JobLease> {
        let job = self
            .load(id)
            .await?
            .ok_or_else(|| CaptureError::NotFound(id.to_string()))?;
        let expires_at = job
            .lease_expires_at
            .ok_or_else(|| CaptureError::LockLost(id.to_string()))?;
        Ok(JobLease {
            lease_id,
            lease_owner: owner,
            expires_at,
            renewals: job.renewals,
            job,
        })
    }
}

fn millis_to_datetime(value: &str) -> Option<DateTime<Utc>> {
    value
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

fn parse_count(fields: &HashMap<String, String>, name: &str) -> u32 {
    fields
        .get(name)
        .and_then(|value| value.parse().ok())
        .unwrap_or_default()
}

fn decode_record(id: &JobId, fields: &HashMap<String, String>) -> Result<JobRecord> {
    let state = fields
        .get("state")
        .and_then(|value| JobState::parse(value))
        .ok_or_else(|| {
            CaptureError::Queue(format!("job {id} has no valid state"))
        })?;
    let payload: CaptureRequest = fields
        .get("payload")
        .map(|raw| serde_json::from_str::<CaptureRequest>(raw))
        .transpose()?
        .ok_or_else(|| {
            CaptureError::Queue(format!("job {id} has no payload"))
        })?;
    let result = fields
        .get("result")
        .map(|raw| serde_json::from_str::<ResultRecord>(raw))
        .transpose()?;

    Ok(JobRecord {
        id: id.clone(),
        payload,
        state,
        attempts: parse_count(fields, "attempts"),
        max_attempts: parse_count(fields, "max_attempts").max(1),
        stalled_count: parse_count(fields, "stalled"),
        lease_id: fields
            .get("lock_token")
            .and_then(|raw| LeaseId::from_str(raw).ok()),
        lease_owner: fields.get("lock_owner").cloned(),
        lease_expires_at: fields
            .get("lock_expires")
            .and_then(|raw| millis_to_datetime(raw)),
        renewals: parse_count(fields, "renewals"),
        result,
        failed_reason: fields.get("failed_reason").cloned(),
        created_at: fields
            .get("created_at")
            .and_then(|raw| millis_to_datetime(raw))
            .unwrap_or_else(Utc::now),
        finished_at: fields
            .get("finished_at")
            .and_then(|raw| millis_to_datetime(raw)),
    })
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn add(
        &self,
        id: &JobId,
        payload: &CaptureRequest,
        options: EnqueueOptions,
    ) -> Result<JobHandle> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(payload)?;
        let remove_after_ms = options
            .remove_after
            .map(|grace| grace.as_millis() as i64)
            .unwrap_or(-1);

        let (accepted, state): (i64, String) = scripts::ADD
            .key(self.job_key(id))
            .key(self.wait_key())
            .arg(id.as_str())
            .arg(payload)
            .arg(options.max_attempts.max(1))
            .arg(Utc::now().timestamp_millis())
            .arg(remove_after_ms)
            .invoke_async(&mut conn)
            .await?;

        let state = JobState::parse(&state).ok_or_else(|| {
            CaptureError::Queue(format!("job {id} has unknown state {state}"))
        })?;
        if accepted == 1 {
            Ok(JobHandle::accepted(id.clone()))
        } else {
            debug!(job = %id, %state, "duplicate job id merged");
            Ok(JobHandle::merged(id.clone(), state))
        }
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        self.load(id).await
    }

    async fn state(&self, id: &JobId) -> Result<Option<JobState>> {
        let mut conn = self.conn.clone();
        let state: Option<String> = conn.hget(self.job_key(id), "state").await?;
        Ok(state.as_deref().and_then(JobState::parse))
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<JobLease>> {
        let mut conn = self.conn.clone();
        let lease_id = LeaseId::new();

        let claimed: Option<String> = scripts::DEQUEUE
            .key(self.wait_key())
            .key(self.active_key())
            .arg(self.job_prefix())
            .arg(lease_id.to_string())
            .arg(&request.worker_id)
            .arg(Utc::now().timestamp_millis())
            .arg(request.lease_ttl.num_milliseconds())
            .invoke_async(&mut conn)
            .await?;

        match claimed {
            Some(id) => {
                let id = JobId::from(id);
                self.load_lease(&id, lease_id, request.worker_id)
                    .await
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    async fn renew(&self, renewal: LeaseRenewal) -> Result<JobLease> {
        let mut conn = self.conn.clone();
        let expires: i64 = scripts::RENEW
            .key(self.job_key(&renewal.job_id))
            .key(self.active_key())
            .arg(renewal.job_id.as_str())
            .arg(renewal.lease_id.to_string())
            .arg(Utc::now().timestamp_millis())
            .arg(renewal.extend_by.num_milliseconds())
            .invoke_async(&mut conn)
            .await?;

        match expires {
            -2 => Err(CaptureError::NotFound(renewal.job_id.to_string())),
            -1 => Err(CaptureError::LockLost(renewal.job_id.to_string())),
            _ => {
                self.load_lease(
                    &renewal.job_id,
                    renewal.lease_id,
                    renewal.worker_id,
                )
                .await
            }
        }
    }

    async fn complete(&self, id: &JobId, lease_id: LeaseId, result: &ResultRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let outcome: i64 = scripts::COMPLETE
            .key(self.job_key(id))
            .key(self.active_key())
            .key(self.stats_key())
            .arg(id.as_str())
            .arg(lease_id.to_string())
            .arg(serde_json::to_string(result)?)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        if outcome < 0 {
            return Err(CaptureError::LockLost(id.to_string()));
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: &JobId,
        lease_id: LeaseId,
        error: &str,
        retryable: bool,
    ) -> Result<JobState> {
        let mut conn = self.conn.clone();
        let outcome: String = scripts::FAIL
            .key(self.job_key(id))
            .key(self.active_key())
            .key(self.stats_key())
            .key(self.wait_key())
            .arg(id.as_str())
            .arg(lease_id.to_string())
            .arg(error)
            .arg(Utc::now().timestamp_millis())
            .arg(if retryable { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        JobState::parse(&outcome)
            .ok_or_else(|| CaptureError::LockLost(id.to_string()))
    }

    async fn scan_stalled(&self) -> Result<StalledScan> {
        let mut conn = self.conn.clone();
        let (recovered, failed): (Vec<String>, Vec<String>) =
            scripts::SCAN_STALLED
                .key(self.active_key())
                .key(self.wait_key())
                .key(self.stats_key())
                .arg(self.job_prefix())
                .arg(Utc::now().timestamp_millis())
                .arg(self.settings.max_stalled_count)
                .arg(STALLED_FAILURE_REASON)
                .invoke_async(&mut conn)
                .await?;

        for id in &failed {
            warn!(job = %id, "stalled job failed");
        }

        Ok(StalledScan {
            recovered: recovered.into_iter().map(JobId::from).collect(),
            failed: failed.into_iter().map(JobId::from).collect(),
        })
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let mut conn = self.conn.clone();
        let waiting: u64 = conn.llen(self.wait_key()).await?;
        let active: u64 = conn.zcard(self.active_key()).await?;
        let stats: HashMap<String, u64> = conn.hgetall(self.stats_key()).await?;

        Ok(QueueCounts {
            waiting,
            active,
            completed: stats.get("completed").copied().unwrap_or_default(),
            failed: stats.get("failed").copied().unwrap_or_default(),
        })
    }
}
