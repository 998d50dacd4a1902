use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

pub(crate) type Flight<T> = Shared<BoxFuture<'static, T>>;

type Slot<T> = Arc<Mutex<Option<Flight<T>>>>;

/// At most one run of a piece of work at a time, shared by every caller.
///
/// The work runs on its own task, so it finishes even when every caller
/// stops waiting.
pub(crate) struct SingleFlight<T> {
    slot: Slot<T>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Join the run in progress, or start `work` when there is none.
    ///
    /// `lost` builds the result handed out when the task dies without one.
    pub(crate) fn run<F, L>(&self, work: F, lost: L) -> Flight<T>
    where
        F: Future<Output = T> + Send + 'static,
        L: FnOnce() -> T + Send + 'static,
    {
        let (done, result) = oneshot::channel();
        let run = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(run) = slot.as_ref() {
                return run.clone();
            }
            let run = async move { result.await.unwrap_or_else(|_| lost()) }
                .boxed()
                .shared();
            *slot = Some(run.clone());
            run
        };

        // Cleared before the result is published, so a caller that sees the
        // result and asks again starts a fresh run.
        let clear = ClearOnDrop(Arc::clone(&self.slot));
        tokio::spawn(async move {
            let outcome = work.await;
            drop(clear);
            let _ = done.send(outcome);
        });
        run
    }
}

struct ClearOnDrop<T>(Slot<T>);

impl<T> Drop for ClearOnDrop<T> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
