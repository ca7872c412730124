//! Out-of-band cancellation of a running evaluation.
//!
//! A [`Termination`] is shared between the thread that runs the isolate and
//! whoever may need to stop it (a session controller reacting to a closed
//! connection or an unanswered prompt). The first recorded reason wins.
//!
//! A [`WaitClock`] tracks how long the script has spent parked on `Input`,
//! so the execution watchdog only charges time the script actually ran.

use std::sync::Arc;
use std::time::{Duration, Instant};

use deno_core::v8;
use parking_lot::Mutex;

/// Why an evaluation was stopped from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The transport connection went away.
    Disconnected,
    /// A prompt was not answered in time.
    PromptTimeout(Duration),
}

#[derive(Default)]
struct Inner {
    reason: Mutex<Option<TerminationReason>>,
    isolate: Mutex<Option<v8::IsolateHandle>>,
}

/// Cloneable handle used to terminate an evaluation from any thread.
#[derive(Clone, Default)]
pub struct Termination {
    inner: Arc<Inner>,
}

impl Termination {
    /// A handle with no reason recorded and no isolate attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the isolate that [`terminate`](Self::terminate) should stop.
    ///
    /// If a reason was recorded before the isolate existed, execution is
    /// terminated right away.
    pub fn attach(&self, handle: v8::IsolateHandle) {
        let already = self.inner.reason.lock().is_some();
        if already {
            handle.terminate_execution();
        }
        *self.inner.isolate.lock() = Some(handle);
    }

    /// Forget the isolate. Called before the runtime is dropped.
    pub fn detach(&self) {
        self.inner.isolate.lock().take();
    }

    /// Record `reason` (unless one is already set) and stop the isolate.
    pub fn terminate(&self, reason: TerminationReason) {
        {
            let mut slot = self.inner.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        if let Some(handle) = self.inner.isolate.lock().as_ref() {
            handle.terminate_execution();
        }
    }

    /// The recorded reason, if any.
    pub fn reason(&self) -> Option<TerminationReason> {
        *self.inner.reason.lock()
    }

    /// Whether a reason has been recorded.
    pub fn is_terminated(&self) -> bool {
        self.reason().is_some()
    }
}

impl std::fmt::Debug for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Termination")
            .field("reason", &self.reason())
            .finish()
    }
}

#[derive(Default)]
struct WaitState {
    since: Option<Instant>,
    total: Duration,
    expired: bool,
}

/// Time an evaluation has spent blocked on `Input`.
///
/// The op layer brackets every blocking prompt with [`begin`](Self::begin)
/// and [`end`](Self::end); the watchdog reads [`charged`](Self::charged) and
/// calls [`expire`](Self::expire) when the budget is spent.
#[derive(Clone, Default)]
pub struct WaitClock {
    state: Arc<Mutex<WaitState>>,
}

impl WaitClock {
    /// A clock with nothing recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a blocking prompt. Returns `false` once the
    /// execution budget has expired; no prompt may be sent then.
    pub fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if state.expired {
            return false;
        }
        if state.since.is_none() {
            state.since = Some(Instant::now());
        }
        true
    }

    /// Mark the end of the prompt started by [`begin`](Self::begin).
    pub fn end(&self) {
        let mut state = self.state.lock();
        if let Some(since) = state.since.take() {
            state.total += since.elapsed();
        }
    }

    /// Whether a prompt is currently outstanding.
    pub fn is_waiting(&self) -> bool {
        self.state.lock().since.is_some()
    }

    /// Time since `started` that was not spent waiting on a prompt.
    pub fn charged(&self, started: Instant) -> Duration {
        let state = self.state.lock();
        let waited = state.total + state.since.map(|s| s.elapsed()).unwrap_or_default();
        started.elapsed().saturating_sub(waited)
    }

    /// Mark the budget as spent, unless a prompt is outstanding or more than
    /// `budget` is still owed. Returns whether the clock expired.
    pub fn expire(&self, started: Instant, budget: Duration) -> bool {
        let mut state = self.state.lock();
        let waited = state.total + state.since.map(|s| s.elapsed()).unwrap_or_default();
        if state.since.is_some() || started.elapsed().saturating_sub(waited) < budget {
            return false;
        }
        state.expired = true;
        true
    }

    /// Whether [`expire`](Self::expire) has fired.
    pub fn is_expired(&self) -> bool {
        self.state.lock().expired
    }
}

impl std::fmt::Debug for WaitClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WaitClock")
            .field("waiting", &state.since.is_some())
            .field("total", &state.total)
            .field("expired", &state.expired)
            .finish()
    }
}
