//! Per-process coalescing of concurrent computations for one fingerprint.
//!
//! The first caller spawns a leader task; later callers subscribe to its
//! result. The leader task outlives any individual caller: a cancelled caller
//! merely drops its receiver, and the computation is aborted only once every
//! waiter has left. This is a local optimization — replicas may still race,
//! which the cache accepts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::error::Result;
use crate::fingerprint::Fingerprint;

type Shared<T> = watch::Sender<Option<Result<T>>>;

pub struct SingleFlight<T> {
    slots: Mutex<HashMap<Fingerprint, Arc<Shared<T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    /// Run `make_compute()` once per fingerprint per process. Returns the
    /// shared outcome and whether this caller coalesced onto an existing
    /// flight. The factory is invoked at most once per call; it is only used
    /// when this caller becomes the leader (or when a dying slot has to be
    /// replaced).
    pub async fn run<F, Fut>(self: &Arc<Self>, fingerprint: Fingerprint, make_compute: F) -> (Result<T>, bool)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut coalesced = false;
        loop {
            let mut receiver = {
                let mut slots = self.slots.lock().await;
                if let Some(sender) = slots.get(&fingerprint) {
                    coalesced = true;
                    sender.subscribe()
                } else {
                    let (sender, receiver) = watch::channel(None);
                    let sender = Arc::new(sender);
                    slots.insert(fingerprint, Arc::clone(&sender));

                    let registry = Arc::clone(self);
                    let compute = make_compute();
                    tokio::spawn(async move {
                        tokio::select! {
                            // Fires once every waiter (including the leader
                            // caller) has dropped its receiver.
                            _ = sender.closed() => {}
                            outcome = compute => {
                                let _ = sender.send(Some(outcome));
                            }
                        }
                        registry.slots.lock().await.remove(&fingerprint);
                    });
                    receiver
                }
            };

            loop {
                if let Some(outcome) = receiver.borrow_and_update().as_ref() {
                    return (outcome.clone(), coalesced);
                }
                if receiver.changed().await.is_err() {
                    // The flight was aborted between our subscribe and its
                    // teardown. Rejoin; most likely we become the new leader.
                    break;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn slot_count(&self) -> usize {
        self.slots.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::error::GatewayError;
    use crate::types::testing::minimal_request;
    use crate::Fingerprinter;

    fn fingerprint() -> Fingerprint {
        Fingerprinter::new(1, Vec::new()).generation(&minimal_request("m", "p"))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_computation() {
        let flights: Arc<SingleFlight<String>> = Arc::new(SingleFlight::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = fingerprint();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                flights
                    .run(fp, move || {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            Ok("done".to_string())
                        }
                    })
                    .await
            }));
        }

        let mut coalesced_count = 0;
        for handle in handles {
            let (outcome, coalesced) = handle.await.unwrap();
            assert_eq!(outcome.unwrap(), "done");
            if coalesced {
                coalesced_count += 1;
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalesced_count, 49);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_propagate_to_every_waiter() {
        let flights: Arc<SingleFlight<String>> = Arc::new(SingleFlight::default());
        let fp = fingerprint();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let flights = Arc::clone(&flights);
            handles.push(tokio::spawn(async move {
                flights
                    .run(fp, || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err(GatewayError::Backend {
                            message: "boom".to_string(),
                        })
                    })
                    .await
            }));
        }

        for handle in handles {
            let (outcome, _) = handle.await.unwrap();
            assert_eq!(outcome.unwrap_err().code(), "backend_error");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slot_is_removed_after_completion() {
        let flights: Arc<SingleFlight<String>> = Arc::new(SingleFlight::default());
        let fp = fingerprint();

        let (outcome, _) = flights.run(fp, || async { Ok("v".to_string()) }).await;
        assert_eq!(outcome.unwrap(), "v");

        // Give the leader task a tick to tear down its slot.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(flights.slot_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn leader_cancellation_hands_off_to_waiters() {
        let flights: Arc<SingleFlight<String>> = Arc::new(SingleFlight::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = fingerprint();

        let leader = {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                flights
                    .run(fp, move || {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(500)).await;
                            Ok("survived".to_string())
                        }
                    })
                    .await
            })
        };

        // Let the leader start, then attach a waiter and kill the leader.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waiter = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                // If the waiter ever recomputed, the outcome would be this
                // error instead of the leader's value.
                flights
                    .run(fp, || async {
                        Err(crate::error::GatewayError::internal("waiter recomputed"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let (outcome, coalesced) = waiter.await.unwrap();
        assert!(coalesced);
        assert_eq!(outcome.unwrap(), "survived");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn computation_is_aborted_when_all_waiters_leave() {
        let flights: Arc<SingleFlight<String>> = Arc::new(SingleFlight::default());
        let finished = Arc::new(AtomicUsize::new(0));
        let fp = fingerprint();

        let caller = {
            let flights = Arc::clone(&flights);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                flights
                    .run(fp, move || {
                        let finished = Arc::clone(&finished);
                        async move {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                            finished.fetch_add(1, Ordering::SeqCst);
                            Ok("never".to_string())
                        }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(flights.slot_count().await, 0);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
