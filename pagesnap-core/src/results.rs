//! Terminal job outcomes, kept independently of queue retention.
//!
//! Queue entries are removed shortly after a job finishes; the result record
//! outlives them by days so that late pollers still get an answer.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{error::Result, queue::JobId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Done,
    Error,
}

/// Where a successful result's image came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// Rendered by the capture engine for this job.
    Capture,
    /// An artifact already stored under the same storage key.
    Cache,
    /// The page's social preview image, used after a failed capture.
    PreviewImage,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ResultSource>,
    pub recorded_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn done(
        image_url: impl Into<String>,
        width: u32,
        height: u32,
        bytes: u64,
        source: ResultSource,
    ) -> Self {
        Self {
            status: ResultStatus::Done,
            image_url: Some(image_url.into()),
            width: Some(width),
            height: Some(height),
            bytes: Some(bytes),
            error: None,
            source: Some(source),
            recorded_at: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Error,
            image_url: None,
            width: None,
            height: None,
            bytes: None,
            error: Some(message.into()),
            source: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == ResultStatus::Done
    }
}

/// TTL-bounded result records keyed by job id.
#[async_trait]
pub trait ResultStore: Send + Sync + fmt::Debug {
    async fn get(&self, job_id: &JobId) -> Result<Option<ResultRecord>>;

    async fn put(&self, job_id: &JobId, record: &ResultRecord, ttl: Duration) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredResult {
    record: ResultRecord,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryResultStore {
    entries: Arc<Mutex<HashMap<JobId, StoredResult>>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn get(&self, job_id: &JobId) -> Result<Option<ResultRecord>> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, stored| stored.expires_at > now);
        Ok(entries.get(job_id).map(|stored| stored.record.clone()))
    }

    async fn put(&self, job_id: &JobId, record: &ResultRecord, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::days(3));
        self.entries.lock().await.insert(
            job_id.clone(),
            StoredResult {
                record: record.clone(),
                expires_at: Utc::now() + ttl,
            },
        );
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_store::RedisResultStore;

#[cfg(feature = "redis")]
mod redis_store {
    use super::*;

    use redis::{AsyncCommands, aio::ConnectionManager};
    use tracing::debug;

    #[derive(Clone)]
    pub struct RedisResultStore {
        conn: ConnectionManager,
        prefix: String,
    }

    impl fmt::Debug for RedisResultStore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RedisResultStore")
                .field("connection", &"ConnectionManager")
                .field("prefix", &self.prefix)
                .finish()
        }
    }

    impl RedisResultStore {
        pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
            Self {
                conn,
                prefix: prefix.into(),
            }
        }

        fn key(&self, job_id: &JobId) -> String {
            format!("{}:result:{}", self.prefix, job_id)
        }
    }

    #[async_trait]
    impl ResultStore for RedisResultStore {
        async fn get(&self, job_id: &JobId) -> Result<Option<ResultRecord>> {
            let key = self.key(job_id);
            let mut conn = self.conn.clone();
            let data: Option<String> = conn.get(&key).await?;
            match data {
                Some(json) => {
                    debug!("Result HIT: {}", key);
                    Ok(Some(serde_json::from_str(&json)?))
                }
                None => Ok(None),
            }
        }

        async fn put(&self, job_id: &JobId, record: &ResultRecord, ttl: Duration) -> Result<()> {
            let key = self.key(job_id);
            debug!("Result SET: {} (TTL: {:?})", key, ttl);
            let json = serde_json::to_string(record)?;
            let mut conn = self.conn.clone();
            conn.set_ex::<_, _, ()>(&key, json, ttl.as_secs().max(1))
                .await?;
            Ok(())
        }
    }
}
