//! Per-target serialization of preview page work.
//!
//! At most one page is "being worked on". A request for that same page is a
//! duplicate and returns at once; a request for any other page waits until
//! the current claim is dropped. Waiting wakes on release and also re-checks
//! every poll interval, so [`PageWorkGate::stop`] always frees waiters.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::trace;

#[derive(Debug, Default)]
struct GateState {
    in_flight: Option<u32>,
    stopped: bool,
}

#[derive(Debug)]
pub struct PageWorkGate {
    state: Mutex<GateState>,
    released: Condvar,
    poll_interval: Duration,
}

#[derive(Debug)]
pub enum GateClaim<'a> {
    Claimed(PageWorkGuard<'a>),
    /// The same page is already being worked on.
    Duplicate,
    /// The gate was stopped (target disposed) before the claim was granted.
    Stopped,
}

impl PageWorkGate {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            released: Condvar::new(),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn claim(&self, page: u32) -> GateClaim<'_> {
        let mut state = self.lock();
        let mut waited = false;
        loop {
            if state.stopped {
                return GateClaim::Stopped;
            }
            match state.in_flight {
                Some(current) if current == page => return GateClaim::Duplicate,
                Some(current) => {
                    if !waited {
                        trace!(page, busy_page = current, "waiting for page work gate");
                    }
                    waited = true;
                    state = match self.released.wait_timeout(state, self.poll_interval) {
                        Ok((guard, _timeout)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
                None => {
                    state.in_flight = Some(page);
                    return GateClaim::Claimed(PageWorkGuard {
                        gate: self,
                        page,
                        waited,
                    });
                }
            }
        }
    }

    /// Refuses all further claims and wakes every waiter.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.released.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    fn release(&self, page: u32) {
        let mut state = self.lock();
        if state.in_flight == Some(page) {
            state.in_flight = None;
        }
        drop(state);
        self.released.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Holds the "being worked on" marker; dropping it clears the marker.
#[derive(Debug)]
pub struct PageWorkGuard<'a> {
    gate: &'a PageWorkGate,
    page: u32,
    waited: bool,
}

impl PageWorkGuard<'_> {
    pub fn page(&self) -> u32 {
        self.page
    }

    /// True when the claim had to wait for another page to finish.
    pub fn waited(&self) -> bool {
        self.waited
    }
}

impl Drop for PageWorkGuard<'_> {
    fn drop(&mut self) {
        self.gate.release(self.page);
    }
}
