use std::sync::Arc;

use pagesnap_core::{IntakeService, StatusPoller, queue::JobId};

#[derive(Clone, Debug)]
pub struct AppState {
    pub intake: Arc<IntakeService>,
    pub status: Arc<StatusPoller>,
    /// Origin clients use to reach this API, without a trailing slash.
    pub public_base_url: Arc<str>,
}

impl AppState {
    pub fn new(intake: IntakeService, status: StatusPoller, public_base_url: &str) -> Self {
        Self {
            intake: Arc::new(intake),
            status: Arc::new(status),
            public_base_url: Arc::from(public_base_url.trim_end_matches('/')),
        }
    }

    pub fn status_url(&self, job_id: &JobId) -> String {
        format!("{}/api/screenshot/{}", self.public_base_url, job_id)
    }
}
