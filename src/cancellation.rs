//! One-shot cancellation signal with callback registration.
//!
//! Each loading session owns a [`CancelTokenSource`]; the tokens it hands
//! out are attached to deferred work (rate-limited launches, queued fetch and
//! processing items) so that cancelling the session reaches everything the
//! session started.
//!
//! # Semantics
//!
//! - `cancel()` is idempotent. The first call runs every registered callback
//!   exactly once, in registration order, on the calling context.
//! - `register` after cancellation runs the callback inline before returning.
//! - `is_cancelling` observes `true` from any thread once `cancel()` has
//!   published its effect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Callback = Box<dyn FnOnce() + Send>;

enum State {
    Active(Vec<Callback>),
    Cancelled,
}

struct Shared {
    cancelled: AtomicBool,
    state: Mutex<State>,
}

/// Produces tokens and owns the one-shot cancel transition.
pub struct CancelTokenSource {
    shared: Arc<Shared>,
}

impl CancelTokenSource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                state: Mutex::new(State::Active(Vec::new())),
            }),
        }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fires the cancellation signal.
    ///
    /// The first call runs all registered callbacks in registration order;
    /// subsequent calls are no-ops.
    pub fn cancel(&self) {
        let callbacks = {
            let mut state = self.shared.state.lock().unwrap();
            match std::mem::replace(&mut *state, State::Cancelled) {
                State::Active(callbacks) => {
                    // Publish before running callbacks so they observe
                    // `is_cancelling() == true`.
                    self.shared.cancelled.store(true, Ordering::SeqCst);
                    callbacks
                }
                State::Cancelled => return,
            }
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Returns true once `cancel()` has fired.
    pub fn is_cancelling(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancelTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle observing one [`CancelTokenSource`].
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    /// Returns true once the source has been cancelled.
    pub fn is_cancelling(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Registers a callback to run when the source is cancelled.
    ///
    /// If the source is already cancelled the callback runs inline before
    /// this method returns. Otherwise it runs exactly once, in registration
    /// order, when `cancel()` first fires.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) {
        let run_inline = {
            let mut state = self.shared.state.lock().unwrap();
            match &mut *state {
                State::Active(callbacks) => {
                    callbacks.push(Box::new(callback));
                    None
                }
                State::Cancelled => Some(callback),
            }
        };
        if let Some(callback) = run_inline {
            callback();
        }
    }
}
