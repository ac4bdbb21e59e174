//! Rolling-window limit on job starts, shared across all workers.

use std::{
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StartLimit {
    pub max_starts: u32,
    pub window: Duration,
}

impl Default for StartLimit {
    fn default() -> Self {
        Self {
            max_starts: 10,
            window: Duration::from_secs(60),
        }
    }
}

/// A recorded start. Return it with [`StartLimiter::release`] when no job
/// was started after all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StartPermit(Uuid);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Granted(StartPermit),
    /// Window is full; the oldest start leaves it after this delay.
    Delayed(Duration),
}

#[async_trait]
pub trait StartLimiter: Send + Sync + fmt::Debug {
    async fn acquire(&self) -> Result<Admission>;

    async fn release(&self, permit: StartPermit) -> Result<()>;
}

/// Sliding-window log held in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryStartLimiter {
    limit: StartLimit,
    log: Arc<Mutex<VecDeque<(Instant, StartPermit)>>>,
}

impl InMemoryStartLimiter {
    pub fn new(limit: StartLimit) -> Self {
        Self {
            limit,
            log: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

#[async_trait]
impl StartLimiter for InMemoryStartLimiter {
    async fn acquire(&self) -> Result<Admission> {
        let now = Instant::now();
        let mut log = self.log.lock().await;
        while log
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) >= self.limit.window)
        {
            log.pop_front();
        }

        if (log.len() as u32) < self.limit.max_starts {
            let permit = StartPermit(Uuid::new_v4());
            log.push_back((now, permit));
            return Ok(Admission::Granted(permit));
        }

        let wait = log
            .front()
            .map(|(at, _)| self.limit.window.saturating_sub(now.duration_since(*at)))
            .unwrap_or(self.limit.window);
        Ok(Admission::Delayed(wait))
    }

    async fn release(&self, permit: StartPermit) -> Result<()> {
        self.log.lock().await.retain(|(_, p)| *p != permit);
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_limiter::RedisStartLimiter;

#[cfg(feature = "redis")]
mod redis_limiter {
    use super::*;

    use chrono::Utc;
    use once_cell::sync::Lazy;
    use redis::{AsyncCommands, Script, aio::ConnectionManager};

    /// Sliding window log keyed by start token.
    static SLIDING_WINDOW_LOG: Lazy<Script> = Lazy::new(|| {
        Script::new(
            r#"
            local key = KEYS[1]
            local now = tonumber(ARGV[1])
            local window = tonumber(ARGV[2])
            local limit = tonumber(ARGV[3])

            -- Remove old entries
            redis.call('ZREMRANGEBYSCORE', key, 0, now - window)

            local current = redis.call('ZCARD', key)
            if current < limit then
                redis.call('ZADD', key, now, ARGV[4])
                redis.call('PEXPIRE', key, window)
                return {1, current + 1, 0}
            else
                local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
                local reset = oldest[2] and (oldest[2] + window - now) or window
                return {0, current, reset}
            end
            "#,
        )
    });

    #[derive(Clone)]
    pub struct RedisStartLimiter {
        conn: ConnectionManager,
        key: String,
        limit: StartLimit,
    }

    impl fmt::Debug for RedisStartLimiter {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RedisStartLimiter")
                .field("connection", &"ConnectionManager")
                .field("key", &self.key)
                .field("limit", &self.limit)
                .finish()
        }
    }

    impl RedisStartLimiter {
        pub fn new(conn: ConnectionManager, prefix: &str, limit: StartLimit) -> Self {
            Self {
                conn,
                key: format!("{prefix}:limiter"),
                limit,
            }
        }
    }

    #[async_trait]
    impl StartLimiter for RedisStartLimiter {
        async fn acquire(&self) -> Result<Admission> {
            let mut conn = self.conn.clone();
            let permit = StartPermit(Uuid::new_v4());
            let reply: Vec<i64> = SLIDING_WINDOW_LOG
                .key(&self.key)
                .arg(Utc::now().timestamp_millis())
                .arg(self.limit.window.as_millis() as i64)
                .arg(self.limit.max_starts)
                .arg(permit.0.to_string())
                .invoke_async(&mut conn)
                .await?;

            match reply.as_slice() {
                [1, ..] => Ok(Admission::Granted(permit)),
                [_, _, reset, ..] => Ok(Admission::Delayed(Duration::from_millis(
                    (*reset).max(1) as u64,
                ))),
                _ => Ok(Admission::Delayed(self.limit.window)),
            }
        }

        async fn release(&self, permit: StartPermit) -> Result<()> {
            let mut conn = self.conn.clone();
            conn.zrem::<_, _, ()>(&self.key, permit.0.to_string())
                .await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grants_up_to_limit_then_delays() {
        let limiter = InMemoryStartLimiter::new(StartLimit {
            max_starts: 2,
            window: Duration::from_secs(60),
        });

        assert!(matches!(limiter.acquire().await.unwrap(), Admission::Granted(_)));
        assert!(matches!(limiter.acquire().await.unwrap(), Admission::Granted(_)));
        match limiter.acquire().await.unwrap() {
            Admission::Delayed(wait) => assert!(wait <= Duration::from_secs(60)),
            other => panic!("expected delay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn released_permit_frees_a_slot() {
        let limiter = InMemoryStartLimiter::new(StartLimit {
            max_starts: 1,
            window: Duration::from_secs(60),
        });
        let Admission::Granted(permit) = limiter.acquire().await.unwrap() else {
            panic!("first start should be granted");
        };
        limiter.release(permit).await.unwrap();
        assert!(matches!(limiter.acquire().await.unwrap(), Admission::Granted(_)));
    }

    #[tokio::test]
    async fn window_rolls_forward() {
        let limiter = InMemoryStartLimiter::new(StartLimit {
            max_starts: 1,
            window: Duration::from_millis(20),
        });
        limiter.acquire().await.unwrap();
        assert!(matches!(limiter.acquire().await.unwrap(), Admission::Delayed(_)));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(matches!(limiter.acquire().await.unwrap(), Admission::Granted(_)));
    }
}
