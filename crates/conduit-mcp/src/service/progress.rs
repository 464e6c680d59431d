use super::Peer;
use crate::{
    error::ServiceError,
    model::{ProgressNotificationParam, ProgressToken},
};

/// Progress sink bound to one `(peer, progress token)` pair.
///
/// Each [`report`](Self::report) sends one `notifications/progress`. When the
/// originating request carried no progress token, the reporter is a no-op.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    peer: Peer,
    token: Option<ProgressToken>,
}

impl ProgressReporter {
    pub(crate) fn new(peer: Peer, token: Option<ProgressToken>) -> Self {
        Self { peer, token }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    pub async fn report(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<(), ServiceError> {
        let Some(token) = &self.token else {
            return Ok(());
        };
        self.peer
            .notify_progress(ProgressNotificationParam {
                progress_token: token.clone(),
                progress,
                total,
                message,
            })
            .await
    }
}
