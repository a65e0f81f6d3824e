//! Counts completions for a suspended waiter
//!
//! Done callbacks call [`Rendezvous::hit`], an optional hub timer calls
//! [`Rendezvous::time_out`], and the waiter resumes on whichever settles
//! first.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Reached,
    TimedOut,
}

struct State {
    hits: usize,
    needed: usize,
    timed_out: bool,
    waker: Option<Waker>,
}

impl State {
    fn outcome(&self) -> Option<Outcome> {
        if self.hits >= self.needed {
            Some(Outcome::Reached)
        } else if self.timed_out {
            Some(Outcome::TimedOut)
        } else {
            None
        }
    }
}

pub(crate) struct Rendezvous {
    state: Mutex<State>,
}

impl Rendezvous {
    pub(crate) fn new(needed: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                hits: 0,
                needed,
                timed_out: false,
                waker: None,
            }),
        })
    }

    pub(crate) fn hit(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.hits += 1;
            if state.hits >= state.needed {
                state.waker.take()
            } else {
                None
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn time_out(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.timed_out = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn wait(self: &Arc<Self>) -> Wait {
        Wait { rv: self.clone() }
    }
}

pub(crate) struct Wait {
    rv: Arc<Rendezvous>,
}

impl Future for Wait {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        let mut state = self.rv.state.lock();
        if let Some(outcome) = state.outcome() {
            return Poll::Ready(outcome);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hub::{self, Hub};
    use std::time::Duration;

    #[test]
    fn test_zero_needed_is_ready() {
        let outcome = Hub::new(HubConfig::virtual_clock())
            .run(async { Rendezvous::new(0).wait().await })
            .unwrap();
        assert_eq!(outcome, Outcome::Reached);
    }

    #[test]
    fn test_hits_beat_timer() {
        let outcome = Hub::new(HubConfig::virtual_clock())
            .run(async {
                let rv = Rendezvous::new(2);
                for ms in [1u64, 2] {
                    let rv = rv.clone();
                    hub::schedule(Duration::from_millis(ms), move || rv.hit());
                }
                let timer = {
                    let rv = rv.clone();
                    hub::schedule(Duration::from_millis(5), move || rv.time_out())
                };
                let outcome = rv.wait().await;
                assert!(timer.cancel());
                outcome
            })
            .unwrap();
        assert_eq!(outcome, Outcome::Reached);
    }

    #[test]
    fn test_timer_beats_hits() {
        let outcome = Hub::new(HubConfig::virtual_clock())
            .run(async {
                let rv = Rendezvous::new(2);
                {
                    let rv = rv.clone();
                    hub::schedule(Duration::from_millis(1), move || rv.hit());
                }
                {
                    let rv = rv.clone();
                    hub::schedule(Duration::from_millis(3), move || rv.time_out());
                }
                rv.wait().await
            })
            .unwrap();
        assert_eq!(outcome, Outcome::TimedOut);
    }
}
