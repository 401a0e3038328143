//! Optional completion signal for background pushes.

use std::future::Future;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// How the immediate push for a write went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  /// The remote accepted the mutation
  Pushed,
  /// The push failed; the item is back in the queue unless it ran out of retries
  Failed(String),
  /// Nothing was pushed now; the queued item waits for the next flush
  Deferred,
  /// The local write itself was aborted, so there is nothing to sync
  Dropped,
}

/// Handle returned by writes. Dropping it leaves the push running.
#[derive(Debug)]
pub struct SyncHandle {
  state: HandleState,
}

#[derive(Debug)]
enum HandleState {
  Ready(SyncOutcome),
  Running(JoinHandle<SyncOutcome>),
}

impl SyncHandle {
  pub(crate) fn ready(outcome: SyncOutcome) -> Self {
    Self {
      state: HandleState::Ready(outcome),
    }
  }

  /// Run `push` in the background. Outside a tokio runtime nothing is
  /// spawned and the work is left to the next queue flush.
  pub(crate) fn spawn<F>(push: F) -> Self
  where
    F: Future<Output = SyncOutcome> + Send + 'static,
  {
    match Handle::try_current() {
      Ok(runtime) => Self {
        state: HandleState::Running(runtime.spawn(push)),
      },
      Err(_) => Self::ready(SyncOutcome::Deferred),
    }
  }

  pub fn is_finished(&self) -> bool {
    match &self.state {
      HandleState::Ready(_) => true,
      HandleState::Running(task) => task.is_finished(),
    }
  }

  /// Whether the local write was aborted, so nothing was stored or queued.
  /// Known without waiting for the push.
  pub fn is_dropped(&self) -> bool {
    matches!(self.state, HandleState::Ready(SyncOutcome::Dropped))
  }

  /// Wait for the push to finish.
  pub async fn outcome(self) -> SyncOutcome {
    match self.state {
      HandleState::Ready(outcome) => outcome,
      HandleState::Running(task) => match task.await {
        Ok(outcome) => outcome,
        Err(e) => SyncOutcome::Failed(format!("sync task did not complete: {}", e)),
      },
    }
  }
}
