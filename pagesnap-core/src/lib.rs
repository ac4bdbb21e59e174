//! Asynchronous web page screenshot pipeline.
//!
//! Requests are validated and checked against an SSRF guard at intake,
//! resolved against content-addressed storage, and otherwise queued under an
//! idempotent job id. Workers claim jobs under renewable leases, render them
//! through a browser backend, upload the image and record the outcome in a
//! TTL-bounded result store that outlives the queue entry.

pub mod cache_key;
pub mod capture;
pub mod error;
pub mod fallback;
pub mod intake;
pub mod limiter;
pub mod queue;
pub mod request;
pub mod results;
pub mod ssrf;
pub mod status;
pub mod storage;
pub mod worker;

pub use cache_key::{CacheKey, StorageKey};
pub use error::{CaptureError, Result, SsrfRejection};
pub use intake::{CacheHit, IntakeService, SubmitOutcome};
pub use request::{CaptureRequest, Viewport};
pub use results::{ResultRecord, ResultSource, ResultStatus};
pub use status::{JobStatus, StatusPoller};
