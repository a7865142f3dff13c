use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use thiserror::Error;

/// The spawned task behind a flight panicked or was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub(crate) struct FlightAborted(pub(crate) String);

type Flight<T> = Shared<BoxFuture<'static, Result<T, FlightAborted>>>;

struct InFlight<T> {
    flight: Flight<T>,
    finished: Arc<AtomicBool>,
}

/// Coalesces concurrent invocations of one operation.
///
/// The first caller spawns the work on the runtime; callers arriving while it
/// is outstanding await the same result. The work runs to completion even if
/// every caller goes away.
pub(crate) struct SingleFlight<T> {
    slot: Mutex<Option<InFlight<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) async fn run<F, Fut>(&self, make: F) -> Result<T, FlightAborted>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut slot = self
                .slot
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match slot.as_ref() {
                // Work that already finished belongs to an earlier call, even
                // if its callers went away before clearing the slot.
                Some(current) if !current.finished.load(Ordering::Acquire) => {
                    current.flight.clone()
                }
                _ => {
                    let finished = Arc::new(AtomicBool::new(false));
                    let work = make();
                    let handle = tokio::spawn({
                        let finished = Arc::clone(&finished);
                        async move {
                            let output = work.await;
                            finished.store(true, Ordering::Release);
                            output
                        }
                    });
                    let flight = async move {
                        handle
                            .await
                            .map_err(|error| FlightAborted(error.to_string()))
                    }
                    .boxed()
                    .shared();
                    *slot = Some(InFlight {
                        flight: flight.clone(),
                        finished,
                    });
                    flight
                }
            }
        };

        let result = flight.clone().await;

        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot
            .as_ref()
            .is_some_and(|current| Shared::ptr_eq(&current.flight, &flight))
        {
            *slot = None;
        }
        result
    }

    pub(crate) fn is_running(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .is_some_and(|current| !current.finished.load(Ordering::Acquire))
    }
}
