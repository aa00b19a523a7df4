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

//! The trip state machine.
//!
//! A [`TripSession`] is created once at boot and lives for the whole
//! process. Only the main loop mutates it; worker threads never see it.

use std::{fmt::Display, time::Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The set of all states the kit can be in.
pub enum TripState {
    /// The kit is booting: drivers are initialized and the boot health
    /// event is emitted. This is the initial state and is never re-entered.
    Boot,
    /// The kit is idle, waiting for a driver to press start.
    /// Telemetry is still collected here so the fleet can see the vehicle
    /// is alive.
    Ready,
    /// Waiting for a badge on the NFC reader.
    /// Leaves back to `Ready` on the back button or after 60 seconds.
    AuthNfc,
    /// The alcohol test is running. Its inner phase is tracked separately
    /// in [`AlcoholPhase`].
    AlcoholCheck,
    /// A trip is in progress: fast telemetry, fatigue monitoring and cabin
    /// alerting are active.
    TripActive,
    /// The driver pressed stop and must confirm before the trip closes.
    TripStopConfirm,
    /// The diagnostics menu. Reachable from `Ready` and `TripActive`;
    /// leaving returns to whichever state it was entered from.
    Menu,
    /// The kit is locked out by the fleet operator.
    /// No local transition enters this state; it exists for a remote
    /// lockout command.
    WarningLock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// The inner phases of the alcohol test.
pub enum AlcoholPhase {
    /// The sensor element is heating up and readings are meaningless.
    Warmup,
    /// The driver is blowing into the sensor.
    Blow,
    /// The test passed; the trip may start.
    Pass,
    /// The test failed; the trip is blocked until a retest passes.
    Fail,
}

impl Display for TripState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TripState::Boot => "BOOT",
            TripState::Ready => "READY",
            TripState::AuthNfc => "AUTH_NFC",
            TripState::AlcoholCheck => "ALCOHOL_CHECK",
            TripState::TripActive => "TRIP_ACTIVE",
            TripState::TripStopConfirm => "TRIP_STOP_CONFIRM",
            TripState::Menu => "MENU",
            TripState::WarningLock => "WARNING_LOCK",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug)]
/// The set of errors that can be caused by driving the state machine.
pub enum Error {
    /// An illegal transition was attempted.
    IllegalTransition {
        /// The state that the transition was attempted from.
        from: TripState,
        /// The state that the transition was attempted into.
        to: TripState,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IllegalTransition { from, to } => {
                write!(f, "illegal state transition {from} -> {to}")
            }
        }
    }
}

/// The current driver session, from boot through any number of trips.
pub struct TripSession {
    /// The current state.
    current: TripState,
    /// The state before the most recent transition.
    /// Used by `Menu` to return to wherever it was entered from.
    previous: TripState,
    /// When the current state was entered.
    state_entered_at: Instant,
    /// The authenticated driver, if any.
    pub driver_id: Option<String>,
    /// A display name for the driver.
    pub driver_name: String,
    /// The uid of the presented badge, colon-separated hex.
    pub badge_uid_hex: Option<String>,
    /// The trip in progress, if any.
    pub trip_id: Option<Uuid>,
    /// Wall time at which the trip in progress started.
    pub trip_started_at: Option<DateTime<Utc>>,
    /// The inner phase of the alcohol test.
    pub alcohol_phase: AlcoholPhase,
    /// When the current alcohol phase started.
    pub alcohol_phase_started_at: Instant,
    /// Wall time at which the current alcohol test began.
    pub alcohol_started_at: Option<DateTime<Utc>>,
    /// Which of the four diagnostics pages the menu is showing.
    pub menu_page: u8,
}

impl TripSession {
    #[must_use]
    /// Construct a new session in the `Boot` state.
    pub fn new() -> TripSession {
        TripSession {
            current: TripState::Boot,
            previous: TripState::Boot,
            state_entered_at: Instant::now(),
            driver_id: None,
            driver_name: "—".into(),
            badge_uid_hex: None,
            trip_id: None,
            trip_started_at: None,
            alcohol_phase: AlcoholPhase::Warmup,
            alcohol_phase_started_at: Instant::now(),
            alcohol_started_at: None,
            menu_page: 0,
        }
    }

    #[must_use]
    /// The current state.
    pub fn current(&self) -> TripState {
        self.current
    }

    #[must_use]
    /// The state before the most recent transition.
    pub fn previous(&self) -> TripState {
        self.previous
    }

    #[must_use]
    /// Seconds spent in the current state so far.
    pub fn time_in_state(&self) -> f64 {
        self.state_entered_at.elapsed().as_secs_f64()
    }

    /// Move the session into a new state.
    /// Moving into the current state is a no-op.
    ///
    /// Leaving the trip states for `Ready` clears the trip; only the stop
    /// confirmation (or a lockout) can do that, so a trip id exists exactly
    /// while a trip is being recorded.
    ///
    /// # Errors
    ///
    /// If `new_state` is not reachable from the current state, an
    /// `Err(Error::IllegalTransition)` will be returned and the session is
    /// left unchanged.
    pub fn transition(&mut self, new_state: TripState) -> Result<(), Error> {
        if new_state == self.current {
            return Ok(());
        }

        let old_state = self.current;

        // determine whether the transition is valid
        let valid_transition = match new_state {
            TripState::Boot => false,
            TripState::Ready => matches!(
                old_state,
                TripState::Boot
                    | TripState::AuthNfc
                    | TripState::AlcoholCheck
                    | TripState::TripStopConfirm
                    | TripState::Menu
                    | TripState::WarningLock
            ),
            TripState::AuthNfc | TripState::WarningLock => old_state == TripState::Ready,
            TripState::AlcoholCheck => old_state == TripState::AuthNfc,
            TripState::TripActive => matches!(
                old_state,
                TripState::AlcoholCheck | TripState::TripStopConfirm | TripState::Menu
            ),
            TripState::TripStopConfirm => old_state == TripState::TripActive,
            TripState::Menu => matches!(old_state, TripState::Ready | TripState::TripActive),
        };

        if !valid_transition {
            return Err(Error::IllegalTransition {
                from: old_state,
                to: new_state,
            });
        }

        self.previous = old_state;
        self.current = new_state;
        self.state_entered_at = Instant::now();
        log::info!("state {old_state} -> {new_state}");

        if new_state == TripState::Ready {
            self.reset_trip();
        }

        Ok(())
    }

    /// Forget the authenticated driver.
    pub fn reset_auth(&mut self) {
        self.driver_id = None;
        self.driver_name = "—".into();
        self.badge_uid_hex = None;
    }

    /// Forget the trip in progress.
    pub fn reset_trip(&mut self) {
        self.trip_id = None;
        self.trip_started_at = None;
    }

    /// Rewind the alcohol test to the start of its warmup phase.
    pub fn reset_alcohol(&mut self) {
        self.alcohol_phase = AlcoholPhase::Warmup;
        self.alcohol_phase_started_at = Instant::now();
        self.alcohol_started_at = None;
    }

    /// Enter a new alcohol phase, restarting the phase timer.
    pub fn enter_alcohol_phase(&mut self, phase: AlcoholPhase) {
        self.alcohol_phase = phase;
        self.alcohol_phase_started_at = Instant::now();
    }

    #[must_use]
    /// Seconds spent in the current alcohol phase.
    pub fn time_in_alcohol_phase(&self) -> f64 {
        self.alcohol_phase_started_at.elapsed().as_secs_f64()
    }
}

impl Default for TripSession {
    fn default() -> Self {
        TripSession::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Test the transitions of a full nominal session.
    fn happy_path() {
        let mut session = TripSession::new();
        assert_eq!(session.current(), TripState::Boot);

        session.transition(TripState::Ready).unwrap();
        session.transition(TripState::AuthNfc).unwrap();
        session.transition(TripState::AlcoholCheck).unwrap();
        session.transition(TripState::TripActive).unwrap();
        session.trip_id = Some(Uuid::new_v4());
        session.transition(TripState::TripStopConfirm).unwrap();
        assert!(session.trip_id.is_some());
        session.transition(TripState::Ready).unwrap();
        assert_eq!(session.previous(), TripState::TripStopConfirm);
    }

    #[test]
    /// Test that a trip cannot start without passing through the alcohol
    /// check.
    fn no_shortcut_to_trip() {
        let mut session = TripSession::new();
        session.transition(TripState::Ready).unwrap();

        let Err(Error::IllegalTransition { from, to }) = session.transition(TripState::TripActive)
        else {
            panic!()
        };
        assert_eq!(from, TripState::Ready);
        assert_eq!(to, TripState::TripActive);
        assert_eq!(session.current(), TripState::Ready);
    }

    #[test]
    /// Test that entering `Ready` clears the trip, so a trip id exists
    /// exactly while a trip is being recorded.
    fn ready_clears_trip() {
        let mut session = TripSession::new();
        session.transition(TripState::Ready).unwrap();
        session.transition(TripState::AuthNfc).unwrap();
        session.transition(TripState::AlcoholCheck).unwrap();
        session.transition(TripState::TripActive).unwrap();
        session.trip_id = Some(Uuid::new_v4());
        session.trip_started_at = Some(Utc::now());

        session.transition(TripState::TripStopConfirm).unwrap();
        // not confirmed yet: backing out resumes the same trip
        session.transition(TripState::TripActive).unwrap();
        assert!(session.trip_id.is_some());

        session.transition(TripState::TripStopConfirm).unwrap();
        session.transition(TripState::Ready).unwrap();
        assert!(session.trip_id.is_none());
        assert!(session.trip_started_at.is_none());
    }

    #[test]
    /// Test that the menu returns to whichever state it was entered from.
    fn menu_remembers_previous() {
        let mut session = TripSession::new();
        session.transition(TripState::Ready).unwrap();
        session.transition(TripState::Menu).unwrap();
        assert_eq!(session.previous(), TripState::Ready);
        session.transition(session.previous()).unwrap();
        assert_eq!(session.current(), TripState::Ready);

        session.transition(TripState::AuthNfc).unwrap();
        session.transition(TripState::AlcoholCheck).unwrap();
        session.transition(TripState::TripActive).unwrap();
        session.trip_id = Some(Uuid::new_v4());
        session.transition(TripState::Menu).unwrap();
        // a trip survives a visit to the menu
        assert!(session.trip_id.is_some());
        session.transition(session.previous()).unwrap();
        assert_eq!(session.current(), TripState::TripActive);
    }

    #[test]
    /// Test that boot is never re-entered.
    fn boot_unreachable() {
        let mut session = TripSession::new();
        session.transition(TripState::Ready).unwrap();
        assert!(session.transition(TripState::Boot).is_err());
    }
}
