use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::Status;

/// Per-call state handed to a handler.
///
/// Clones share the same cancellation token, so a clone moved into a
/// response stream observes the same cancellation as the original.
#[derive(Debug, Clone)]
pub struct CallContext {
    method: Arc<str>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(method: &str) -> Self {
        Self {
            method: Arc::from(method),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A timeout too large to represent as an instant leaves the call
    /// without a deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Marks the call as abandoned by the caller.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    /// Fails with the matching status once the deadline has passed or the
    /// caller canceled. The deadline wins when both hold.
    pub fn check(&self) -> Result<(), Status> {
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Status::deadline_exceeded(format!(
                "deadline for {} has passed",
                self.method
            )));
        }
        if self.cancel.is_cancelled() {
            return Err(Status::cancelled(format!(
                "the client has canceled {}",
                self.method
            )));
        }
        Ok(())
    }

    /// Resolves when the call is canceled or its deadline passes.
    pub async fn done(&self) -> Status {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = deadline => {}
        }

        match self.check() {
            Err(status) => status,
            Ok(()) => Status::cancelled(format!("{} was abandoned", self.method)),
        }
    }
}
