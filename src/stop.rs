/*
  roadkit, a driver-safety kit firmware.
  Copyright (C) 2026 the roadkit authors.

  roadkit is free software: you can redistribute it and/or modify
  it under the terms of the GNU General Public License as published by
  the Free Software Foundation, either version 3 of the License, or
  (at your option) any later version.

  roadkit is distributed in the hope that it will be useful,
  but WITHOUT ANY WARRANTY; without even the implied warranty of
  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
  GNU General Public License for more details.

  You should have received a copy of the GNU General Public License
  along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! Cooperative cancellation for worker threads.
//!
//! Every long-lived thread in the firmware receives a clone of one
//! `StopToken` and checks it at least once per second. Blocking waits go
//! through [`StopToken::wait_timeout`] so that stopping wakes the sleeper
//! immediately instead of at its next period boundary.

use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

#[derive(Clone, Default)]
/// A shared flag used to ask worker threads to wind down.
pub struct StopToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopToken {
    #[must_use]
    /// Construct a new token in the running (not stopped) state.
    pub fn new() -> StopToken {
        StopToken::default()
    }

    /// Ask every holder of this token to stop.
    /// Wakes all threads currently blocked in [`StopToken::wait_timeout`].
    pub fn stop(&self) {
        let (lock, cvar) = &*self.inner;
        // a poisoned flag means some thread panicked; we are shutting down
        // anyway, so take the flag regardless
        let mut stopped = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *stopped = true;
        cvar.notify_all();
    }

    #[must_use]
    /// Whether stop has been requested.
    pub fn is_stopped(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Block for up to `timeout`, returning early if stop is requested.
    /// Returns `true` if the token was stopped (now or while waiting).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut stopped = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let deadline = std::time::Instant::now() + timeout;
        while !*stopped {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            stopped = guard;
        }
        true
    }
}
