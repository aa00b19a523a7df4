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

//! The main loop: drives the trip state machine off button and sensor
//! events, emits every domain event into the outbox, and keeps the panel
//! honest.
//!
//! The loop ticks at ten hertz. One tick polls the buttons, runs the
//! current state's handler, and then the periodic work (telemetry
//! cadence, network refresh). All outbox writes and all actuator calls
//! happen here, on this one thread.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::{
    config::Configuration,
    display::{self, MenuData, Panel},
    events::{
        utc_iso, AlcoholEvent, AlertEvent, AlertType, HealthEvent, KitIdentity, NfcAuthEvent,
        Severity, TelemetryPoint, TripCloseEvent, TripOpenEvent,
    },
    fatigue::FatigueWorker,
    hardware::{
        buttons::{ButtonEvent, ButtonPad},
        buzzer::{Buzzer, Pattern},
        dht22::Dht22,
        gas::GasSensor,
        gps::GpsDriver,
        led::{Color, RgbLed},
        nfc::NfcReader,
        GpioPin,
    },
    outbox::{Endpoint, Outbox},
    state::{AlcoholPhase, TripSession, TripState},
    stop::StopToken,
    sync::ApiClient,
    KitError, FW_VERSION,
};

/// Main loop period.
const TICK: Duration = Duration::from_millis(100);

/// How long the boot splash stays up.
const BOOT_SPLASH_S: f64 = 2.0;

/// Seconds before an unanswered badge prompt falls back to ready.
const AUTH_TIMEOUT_S: f64 = 60.0;

/// How long the badge reader is given per poll. Short enough to keep the
/// loop near its nominal rate.
const NFC_POLL: Duration = Duration::from_millis(100);

/// Period of the cellular network info refresh.
const NETWORK_REFRESH: Duration = Duration::from_secs(30);

/// All the hardware the controller talks to.
pub struct Devices<P: GpioPin + Send + 'static> {
    pub gps: GpsDriver,
    pub env: Dht22<P>,
    pub gas: GasSensor<P>,
    pub nfc: Box<dyn NfcReader + Send>,
    pub buzzer: Buzzer<P>,
    pub led: RgbLed<P>,
    pub buttons: ButtonPad<P>,
    pub panel: Box<dyn Panel + Send>,
}

/// The controller: one per process, driven from the main thread only.
pub struct Controller<'a, P: GpioPin + Send + 'static> {
    config: &'a Configuration,
    identity: KitIdentity,
    outbox: &'a Outbox,
    api: &'a ApiClient,
    devices: Devices<P>,
    fatigue: FatigueWorker,
    session: TripSession,
    /// Init status of every driver, reported in the boot health event
    /// and on the diagnostics menu.
    driver_status: BTreeMap<String, bool>,
    started_at: Instant,
    boot_health_sent: bool,
    last_telemetry: Option<Instant>,
    last_network_refresh: Option<Instant>,
    /// Edge flags: one alert per episode, reset when the condition
    /// clears.
    fatigue_alerted: bool,
    gas_alerted: bool,
    temp_alerted: bool,
    temp_warned: bool,
}

impl<'a, P: GpioPin + Send + 'static> Controller<'a, P> {
    #[must_use]
    pub fn new(
        config: &'a Configuration,
        outbox: &'a Outbox,
        api: &'a ApiClient,
        devices: Devices<P>,
        fatigue: FatigueWorker,
        driver_status: BTreeMap<String, bool>,
    ) -> Controller<'a, P> {
        Controller {
            config,
            identity: KitIdentity {
                org_id: config.org_id.clone(),
                vehicle_id: config.vehicle_id.clone(),
                kit_id: config.kit_id.clone(),
            },
            outbox,
            api,
            devices,
            fatigue,
            session: TripSession::new(),
            driver_status,
            started_at: Instant::now(),
            boot_health_sent: false,
            last_telemetry: None,
            last_network_refresh: None,
            fatigue_alerted: false,
            gas_alerted: false,
            temp_alerted: false,
            temp_warned: false,
        }
    }

    /// Tick until asked to stop, then wind the workers down.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbox store fails; everything else is
    /// degraded around, not propagated.
    pub fn run_loop(&mut self, stop: &StopToken) -> Result<(), KitError> {
        while !stop.is_stopped() {
            self.tick()?;
            if stop.wait_timeout(TICK) {
                break;
            }
        }

        self.fatigue.stop();
        self.devices.led.off();
        Ok(())
    }

    /// One main loop iteration.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbox store fails.
    pub fn tick(&mut self) -> Result<(), KitError> {
        let button = self.devices.buttons.poll();
        if let Some(button) = button {
            log::debug!("button {button:?} in {}", self.session.current());
        }
        self.handle_state(button)?;
        self.periodic()?;
        Ok(())
    }

    fn handle_state(&mut self, button: Option<ButtonEvent>) -> Result<(), KitError> {
        match self.session.current() {
            TripState::Boot => self.state_boot(),
            TripState::Ready => self.state_ready(button),
            TripState::AuthNfc => self.state_auth(button),
            TripState::AlcoholCheck => self.state_alcohol(button),
            TripState::TripActive => self.state_trip(button),
            TripState::TripStopConfirm => self.state_stop_confirm(button),
            TripState::Menu => {
                self.state_menu(button);
                Ok(())
            }
            TripState::WarningLock => {
                self.devices.led.set_named(Color::Red);
                self.show(&display::screen_warning_lock());
                Ok(())
            }
        }
    }

    // ── boot ────────────────────────────────────────────────────────

    fn state_boot(&mut self) -> Result<(), KitError> {
        if !self.boot_health_sent {
            self.show(&display::screen_boot(
                &self.config.kit_serial,
                FW_VERSION,
                &self.driver_status,
            ));
            self.devices.led.set_named(Color::Info);
            self.devices.buzzer.play(Pattern::Info);

            let health = HealthEvent {
                time: utc_iso(),
                org_id: self.identity.org_id.clone(),
                kit_id: self.identity.kit_id.clone(),
                event_type: "boot".into(),
                firmware_version: FW_VERSION.into(),
                drivers: self.driver_status.clone(),
            };
            self.enqueue(Endpoint::Health, &health)?;
            self.boot_health_sent = true;
        }

        if self.session.time_in_state() >= BOOT_SPLASH_S {
            self.transition(TripState::Ready);
            self.devices.led.set_named(Color::Ok);
        }
        Ok(())
    }

    // ── ready ───────────────────────────────────────────────────────

    fn state_ready(&mut self, button: Option<ButtonEvent>) -> Result<(), KitError> {
        let gps = self.devices.gps.read();
        let env = self.devices.env.read();
        self.show(&display::screen_ready(
            &self.session.driver_name,
            gps.gps_ok,
            gps.satellites,
            &gps.network_type,
            gps.rssi_dbm,
            env.temperature_c,
            self.outbox.queue_size()?,
            self.api.is_online(),
        ));

        match button {
            Some(ButtonEvent::Start) => {
                self.transition(TripState::AuthNfc);
                self.devices.buzzer.play(Pattern::Info);
            }
            Some(ButtonEvent::Menu) => self.transition(TripState::Menu),
            _ => {}
        }
        Ok(())
    }

    // ── badge authentication ────────────────────────────────────────

    fn state_auth(&mut self, button: Option<ButtonEvent>) -> Result<(), KitError> {
        #[allow(clippy::cast_possible_truncation)]
        let blink = (self.session.time_in_state() * 2.0) as i64 % 2 == 0;
        self.show(&display::screen_auth(blink));

        if button == Some(ButtonEvent::Back) {
            self.session.reset_auth();
            self.transition(TripState::Ready);
            return Ok(());
        }

        if let Some(badge) = self.devices.nfc.scan(NFC_POLL) {
            let auth_result = match self.outbox.lookup_badge(&badge.uid_hash)? {
                Some(cached) => {
                    self.session.driver_id = Some(cached.driver_id);
                    self.session.driver_name = cached.driver_name;
                    "success"
                }
                None => {
                    // unknown badge: allowed offline, validated on the
                    // server side once the event lands
                    self.session.driver_id = Some(badge.uid_hash[..8].to_string());
                    let tail_start = badge.uid_hex.len().saturating_sub(8);
                    self.session.driver_name = format!("Badge {}", &badge.uid_hex[tail_start..]);
                    "offline_allowed"
                }
            };
            self.session.badge_uid_hex = Some(badge.uid_hex.clone());
            log::info!(
                "badge {} -> {} ({auth_result})",
                badge.uid_hex,
                self.session.driver_name
            );

            let gps = self.devices.gps.read();
            let event = NfcAuthEvent {
                ts: utc_iso(),
                org_id: self.identity.org_id.clone(),
                kit_id: self.identity.kit_id.clone(),
                vehicle_id: self.identity.vehicle_id.clone(),
                badge_uid_hash: badge.uid_hash,
                driver_id: self.session.driver_id.clone().unwrap_or_default(),
                auth_result: auth_result.into(),
                lat: gps.lat,
                lon: gps.lon,
            };
            self.enqueue(Endpoint::NfcAuth, &event)?;

            self.show(&display::screen_auth_result(&self.session.driver_name));
            self.devices.buzzer.play(Pattern::Success);
            self.devices.led.set_named(Color::Ok);

            self.transition(TripState::AlcoholCheck);
            self.session.reset_alcohol();
            self.session.alcohol_started_at = Some(Utc::now());
            return Ok(());
        }

        if self.session.time_in_state() > AUTH_TIMEOUT_S {
            self.session.reset_auth();
            self.transition(TripState::Ready);
        }
        Ok(())
    }

    // ── alcohol test ────────────────────────────────────────────────

    #[allow(clippy::cast_precision_loss)]
    fn state_alcohol(&mut self, button: Option<ButtonEvent>) -> Result<(), KitError> {
        let elapsed = self.session.time_in_alcohol_phase();

        match self.session.alcohol_phase {
            AlcoholPhase::Warmup => {
                self.show(&display::screen_alcohol_warmup(
                    elapsed,
                    self.config.alcohol_warmup_s,
                ));
                if elapsed >= self.config.alcohol_warmup_s as f64 {
                    self.session.enter_alcohol_phase(AlcoholPhase::Blow);
                    self.devices.buzzer.play(Pattern::Info);
                }
            }
            AlcoholPhase::Blow => {
                let countdown = (self.config.alcohol_blow_s as f64 - elapsed).max(0.0);
                self.show(&display::screen_alcohol_blow(countdown));
                if elapsed >= self.config.alcohol_blow_s as f64 {
                    self.finish_alcohol_test()?;
                }
            }
            AlcoholPhase::Pass => {
                self.show(&display::screen_alcohol_pass());
                if button == Some(ButtonEvent::Start) {
                    self.open_trip()?;
                    return Ok(());
                }
            }
            AlcoholPhase::Fail => {
                self.show(&display::screen_alcohol_fail());
                match button {
                    Some(ButtonEvent::Start) => {
                        // retest from the top of the warmup
                        self.session.reset_alcohol();
                        self.session.alcohol_started_at = Some(Utc::now());
                    }
                    Some(ButtonEvent::Back) => {
                        self.session.reset_auth();
                        self.session.reset_alcohol();
                        self.devices.led.set_named(Color::Ok);
                        self.transition(TripState::Ready);
                    }
                    _ => {}
                }
                return Ok(());
            }
        }

        // back cancels the test from any phase but fail, which handles
        // its own buttons above
        if button == Some(ButtonEvent::Back) {
            self.session.reset_auth();
            self.session.reset_alcohol();
            self.transition(TripState::Ready);
        }
        Ok(())
    }

    /// The blow window closed: read the sensor, emit the verdict.
    fn finish_alcohol_test(&mut self) -> Result<(), KitError> {
        let gas = self.devices.gas.read();
        let failed = gas.gas_detected;
        let ts_end = utc_iso();

        let event = AlcoholEvent {
            ts_start: self
                .session
                .alcohol_started_at
                .map_or_else(utc_iso, format_wall),
            ts_end: ts_end.clone(),
            org_id: self.identity.org_id.clone(),
            kit_id: self.identity.kit_id.clone(),
            vehicle_id: self.identity.vehicle_id.clone(),
            driver_id: self.session.driver_id.clone(),
            sensor_warmup_time_s: self.config.alcohol_warmup_s,
            ttl_state: gas.ttl_state,
            result: if failed { "fail" } else { "pass" }.into(),
            sensor_ok: gas.ok,
        };
        self.enqueue(Endpoint::Alcohol, &event)?;

        if failed {
            self.session.enter_alcohol_phase(AlcoholPhase::Fail);
            self.devices.buzzer.play(Pattern::Critical);
            self.devices.led.blink(
                Color::Red,
                Duration::from_millis(300),
                Duration::from_millis(300),
            );

            let alert = AlertEvent::now(
                &self.identity,
                None,
                AlertType::AlcoholFail,
                Severity::Critical,
                "alcohol test failed, trip blocked",
            )
            .with_meta(serde_json::json!({
                "driver_id": self.session.driver_id,
            }));
            self.enqueue(Endpoint::Alert, &alert)?;
        } else {
            if !gas.ok {
                // no sensor: the test degrades to a pass, and the event
                // carries sensor_ok=false so the server can tell
                log::warn!("alcohol verdict taken without a readable gas sensor");
            }
            self.session.enter_alcohol_phase(AlcoholPhase::Pass);
            self.devices.buzzer.play(Pattern::Success);
            self.devices.led.set_named(Color::Ok);
        }
        Ok(())
    }

    /// A passed test was confirmed with start: the trip begins.
    fn open_trip(&mut self) -> Result<(), KitError> {
        let trip_id = Uuid::new_v4();
        let started = Utc::now();
        self.session.trip_id = Some(trip_id);
        self.session.trip_started_at = Some(started);

        let gps = self.devices.gps.read();
        let event = TripOpenEvent {
            trip_id: trip_id.to_string(),
            org_id: self.identity.org_id.clone(),
            vehicle_id: self.identity.vehicle_id.clone(),
            kit_id: self.identity.kit_id.clone(),
            driver_id: self.session.driver_id.clone(),
            start_time: format_wall(started),
            start_lat: gps.lat,
            start_lon: gps.lon,
            status: "active".into(),
        };
        self.enqueue(Endpoint::TripOpen, &event)?;
        log::info!("trip {trip_id} opened");

        if !self.fatigue.start() && self.fatigue.is_present() {
            log::warn!("fatigue pipeline failed to start for this trip");
        }

        self.transition(TripState::TripActive);
        self.devices.buzzer.play(Pattern::Success);
        Ok(())
    }

    // ── trip ────────────────────────────────────────────────────────

    fn state_trip(&mut self, button: Option<ButtonEvent>) -> Result<(), KitError> {
        let gps = self.devices.gps.read();
        let snapshot = self.fatigue.read();
        let elapsed_min = self
            .session
            .trip_started_at
            .map_or(0.0, |started| {
                (Utc::now() - started).num_seconds() as f64 / 60.0
            });

        self.show(&display::screen_trip(
            gps.speed_gps_kmh,
            gps.gps_ok,
            &gps.network_type,
            self.outbox.queue_size()?,
            snapshot.level,
            elapsed_min,
            self.api.is_online(),
        ));

        // fatigue, edge-triggered per episode; an uncalibrated pipeline
        // (ok = false) never alerts
        if snapshot.ok && snapshot.level >= 2 {
            if !self.fatigue_alerted {
                self.fatigue_alerted = true;
                self.devices.led.blink(
                    Color::Red,
                    Duration::from_millis(200),
                    Duration::from_millis(200),
                );
                self.devices.buzzer.play(Pattern::Critical);

                let alert = AlertEvent::now(
                    &self.identity,
                    self.session.trip_id.map(|id| id.to_string()),
                    AlertType::FatigueAlert,
                    Severity::Critical,
                    format!("fatigue level {}", snapshot.level),
                )
                .with_meta(serde_json::json!({
                    "nod_count": snapshot.nod_count,
                    "yawn_count": snapshot.yawn_count,
                    "is_microsleep": snapshot.is_microsleep,
                    "head_down_sec": snapshot.head_down_sec,
                }));
                self.enqueue(Endpoint::Alert, &alert)?;
            }
        } else {
            self.fatigue_alerted = false;
            if snapshot.ok && snapshot.level == 1 {
                self.devices.led.set_named(Color::Warning);
            } else {
                self.devices.led.set_named(Color::Ok);
            }
        }

        // cabin gas
        let gas = self.devices.gas.read();
        if gas.gas_detected {
            if !self.gas_alerted {
                self.gas_alerted = true;
                self.devices.buzzer.play(Pattern::Critical);
                let alert = AlertEvent::now(
                    &self.identity,
                    self.session.trip_id.map(|id| id.to_string()),
                    AlertType::GasDetected,
                    Severity::Critical,
                    "gas detected in the cabin",
                );
                self.enqueue(Endpoint::Alert, &alert)?;
            }
        } else {
            self.gas_alerted = false;
        }

        // cabin temperature
        let env = self.devices.env.read();
        let temp = env.temperature_c.unwrap_or(0.0);
        if temp >= self.config.temp_critical_c {
            if !self.temp_alerted {
                self.temp_alerted = true;
                self.devices.buzzer.play(Pattern::Critical);
                let alert = AlertEvent::now(
                    &self.identity,
                    self.session.trip_id.map(|id| id.to_string()),
                    AlertType::TempCritical,
                    Severity::Critical,
                    format!("cabin temperature critical: {temp:.1} C"),
                );
                self.enqueue(Endpoint::Alert, &alert)?;
            }
        } else {
            self.temp_alerted = false;
            if temp >= self.config.temp_warn_c {
                // warning beep only, no event
                if !self.temp_warned {
                    self.temp_warned = true;
                    self.devices.buzzer.play(Pattern::Warning);
                }
            } else {
                self.temp_warned = false;
            }
        }

        match button {
            Some(ButtonEvent::Stop) => {
                self.transition(TripState::TripStopConfirm);
                self.devices.buzzer.play(Pattern::Info);
            }
            Some(ButtonEvent::Menu) => self.transition(TripState::Menu),
            _ => {}
        }
        Ok(())
    }

    fn state_stop_confirm(&mut self, button: Option<ButtonEvent>) -> Result<(), KitError> {
        self.show(&display::screen_stop_confirm());

        match button {
            Some(ButtonEvent::Start) => self.close_trip()?,
            Some(ButtonEvent::Back) => self.transition(TripState::TripActive),
            _ => {}
        }
        Ok(())
    }

    /// The driver confirmed the stop: close the trip and go home.
    fn close_trip(&mut self) -> Result<(), KitError> {
        if let Some(trip_id) = self.session.trip_id {
            let gps = self.devices.gps.read();
            let event = TripCloseEvent {
                trip_id: trip_id.to_string(),
                org_id: self.identity.org_id.clone(),
                vehicle_id: self.identity.vehicle_id.clone(),
                kit_id: self.identity.kit_id.clone(),
                end_time: utc_iso(),
                end_lat: gps.lat,
                end_lon: gps.lon,
                status: "stopped_by_button".into(),
            };
            self.enqueue(Endpoint::TripClose, &event)?;
            log::info!("trip {trip_id} closed");
        }

        self.fatigue.stop();
        self.session.reset_auth();
        self.devices.led.set_named(Color::Ok);
        self.devices.buzzer.play(Pattern::Success);
        // entering ready clears the trip from the session
        self.transition(TripState::Ready);
        Ok(())
    }

    // ── menu ────────────────────────────────────────────────────────

    fn state_menu(&mut self, button: Option<ButtonEvent>) {
        let gps = self.devices.gps.read();
        let data = MenuData {
            sensors: self.driver_status.clone(),
            queue_size: self.outbox.queue_size().unwrap_or(-1),
            last_sync: self.api.last_ok_time().map(|time| {
                DateTime::<Utc>::from(time)
                    .format("%H:%M:%S")
                    .to_string()
            }),
            sync_fails: self.api.consecutive_fails(),
            gps_fix: gps.gps_ok,
            gps_sats: gps.satellites,
            lat: gps.lat,
            serial: self.config.kit_serial.clone(),
            version: FW_VERSION.into(),
            uptime_min: self.started_at.elapsed().as_secs() / 60,
        };
        self.show(&display::screen_menu(self.session.menu_page, &data));

        match button {
            Some(ButtonEvent::Menu) => {
                self.session.menu_page = (self.session.menu_page + 1) % 4;
            }
            Some(ButtonEvent::Back) => {
                self.session.menu_page = 0;
                self.transition(self.session.previous());
            }
            _ => {}
        }
    }

    // ── periodic work ───────────────────────────────────────────────

    fn periodic(&mut self) -> Result<(), KitError> {
        let now = Instant::now();

        // telemetry is collected while driving, and while ready so the
        // fleet can see the vehicle is alive
        let state = self.session.current();
        if matches!(state, TripState::Ready | TripState::TripActive)
            && due(self.last_telemetry, now, self.config.telemetry_interval())
        {
            self.last_telemetry = Some(now);
            let point = TelemetryPoint::compose(
                &self.identity,
                self.session.trip_id.map(|id| id.to_string()),
                &self.devices.gps.read(),
                &self.devices.env.read(),
                &self.devices.gas.read(),
                &self.fatigue.read(),
            );
            self.outbox.enqueue(Endpoint::Telemetry, &point.into_payload())?;
        }

        if due(self.last_network_refresh, now, NETWORK_REFRESH) {
            self.last_network_refresh = Some(now);
            self.devices.gps.refresh_network();
        }
        Ok(())
    }

    // ── small helpers ───────────────────────────────────────────────

    fn show(&mut self, lines: &[String]) {
        self.devices.panel.show(lines);
    }

    fn enqueue(&self, endpoint: Endpoint, event: &impl serde::Serialize) -> Result<(), KitError> {
        let payload = serde_json::to_value(event).unwrap_or_default();
        self.outbox.enqueue(endpoint, &payload)?;
        Ok(())
    }

    /// Apply a transition; an illegal one is a firmware bug, logged and
    /// dropped rather than crashing a moving vehicle's kit.
    fn transition(&mut self, state: TripState) {
        if let Err(e) = self.session.transition(state) {
            log::error!("{e}");
        }
    }
}

/// Whether a periodic task is due at `now`, firing immediately on the
/// first call.
fn due(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
    last.map_or(true, |last| now.duration_since(last) >= interval)
}

/// An event timestamp from a stored wall time.
fn format_wall(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, thread::sleep};

    use serde_json::Value;

    use crate::{
        display::AbsentPanel,
        fatigue::FatigueConfig,
        hardware::{nfc::Badge, ListenerPin},
        state::AlcoholPhase,
    };

    use super::*;

    /// The SHA-256 of uid bytes 04 A1 B2 C3, from the NFC driver tests.
    const BADGE_HASH: &str = "461b5a59324397cd78a3868910a48a7a89b7694fe7187590e823a2f3bb8f5adf";

    struct ScriptedNfc(VecDeque<Badge>);

    impl NfcReader for ScriptedNfc {
        fn scan(&mut self, _: Duration) -> Option<Badge> {
            self.0.pop_front()
        }
    }

    fn test_config() -> Configuration {
        let json = r#"{
            "org_id": "org-1",
            "vehicle_id": "veh-1",
            "kit_id": "kit-1",
            "kit_serial": "RK-TEST-001",
            "kit_key": "aa55",
            "telemetry_interval_s": 1,
            "alcohol_warmup_s": 0,
            "alcohol_blow_s": 0
        }"#;
        Configuration::parse(&mut std::io::Cursor::new(json)).unwrap()
    }

    /// The scripted pins a test can drive: four buttons plus the gas
    /// line (high = clean air).
    struct Rig {
        buttons: [ListenerPin; 4],
        gas: ListenerPin,
    }

    fn rig_devices(badges: Vec<Badge>) -> (Rig, Devices<ListenerPin>) {
        let rig = Rig {
            buttons: [
                ListenerPin::new(true),
                ListenerPin::new(true),
                ListenerPin::new(true),
                ListenerPin::new(true),
            ],
            gas: ListenerPin::new(true),
        };
        let devices = Devices {
            gps: GpsDriver::absent(),
            env: Dht22::absent(),
            gas: GasSensor::new(rig.gas.clone()),
            nfc: Box::new(ScriptedNfc(badges.into())),
            buzzer: Buzzer::absent(),
            led: RgbLed::absent(),
            buttons: ButtonPad::new(rig.buttons.clone()),
            panel: Box::new(AbsentPanel),
        };
        (rig, devices)
    }

    fn status_map() -> BTreeMap<String, bool> {
        BTreeMap::from([("GPS".to_string(), false), ("GAS".to_string(), true)])
    }

    /// Press and release one button through a tick each.
    fn press(controller: &mut Controller<ListenerPin>, rig: &Rig, index: usize) {
        rig.buttons[index].clone().write(false).unwrap();
        controller.tick().unwrap();
        rig.buttons[index].clone().write(true).unwrap();
        controller.tick().unwrap();
    }

    /// All enqueued rows as `(endpoint, payload)` pairs.
    fn rows(outbox: &Outbox) -> Vec<(String, Value)> {
        outbox
            .dequeue_batch(500)
            .unwrap()
            .into_iter()
            .map(|item| {
                (
                    item.endpoint,
                    serde_json::from_str(&item.payload).unwrap(),
                )
            })
            .collect()
    }

    /// Walk a freshly built controller from boot into an active trip.
    /// The scripted badge is consumed on the release tick of the first
    /// start press, so that press lands the session in the alcohol test.
    fn walk_to_trip(controller: &mut Controller<ListenerPin>, rig: &Rig) {
        controller.tick().unwrap(); // boot actions
        controller.session.transition(TripState::Ready).unwrap();

        press(controller, rig, 0); // start -> auth -> badge consumed
        assert_eq!(controller.session.current(), TripState::AlcoholCheck);

        controller.tick().unwrap(); // warmup (0 s) -> blow
        controller.tick().unwrap(); // blow (0 s) -> verdict
        assert_eq!(controller.session.alcohol_phase, AlcoholPhase::Pass);

        sleep(Duration::from_millis(210)); // same-button debounce
        press(controller, rig, 0); // confirm -> trip
        assert_eq!(controller.session.current(), TripState::TripActive);
    }

    #[test]
    /// The happy path: boot, authenticate, pass the test, open a trip,
    /// close it. Checks the emitted event sequence end to end.
    fn happy_path() {
        let config = test_config();
        let outbox = Outbox::open_in_memory().unwrap();
        let api = ApiClient::new("http://127.0.0.1:1", "RK-1", "aa55").unwrap();
        let (rig, devices) = rig_devices(vec![Badge::from_uid(&[0x04, 0xA1, 0xB2, 0xC3])]);
        let fatigue = FatigueWorker::new(FatigueConfig::default(), None);
        let mut controller =
            Controller::new(&config, &outbox, &api, devices, fatigue, status_map());

        walk_to_trip(&mut controller, &rig);
        assert!(controller.session.trip_id.is_some());
        let trip_id = controller.session.trip_id.unwrap().to_string();

        // stop, back out once, stop again, confirm
        sleep(Duration::from_millis(210));
        press(&mut controller, &rig, 1); // stop
        assert_eq!(controller.session.current(), TripState::TripStopConfirm);
        press(&mut controller, &rig, 3); // back -> resume trip
        assert_eq!(controller.session.current(), TripState::TripActive);
        sleep(Duration::from_millis(210));
        press(&mut controller, &rig, 1); // stop
        sleep(Duration::from_millis(210));
        press(&mut controller, &rig, 0); // confirm
        assert_eq!(controller.session.current(), TripState::Ready);
        assert!(controller.session.trip_id.is_none());

        let rows = rows(&outbox);
        let sequence: Vec<&str> = rows
            .iter()
            .map(|(endpoint, _)| endpoint.as_str())
            .filter(|endpoint| *endpoint != "telemetry")
            .collect();
        assert_eq!(
            sequence,
            ["health", "nfc_auth", "alcohol", "trip_open", "trip_close"]
        );

        let (_, health) = &rows[0];
        assert_eq!(health["event_type"], "boot");
        assert_eq!(health["firmware_version"], FW_VERSION);
        assert_eq!(health["drivers"]["GPS"], false);

        let (_, auth) = rows.iter().find(|(e, _)| e == "nfc_auth").unwrap();
        assert_eq!(auth["badge_uid_hash"], BADGE_HASH);
        assert_eq!(auth["auth_result"], "offline_allowed");
        assert_eq!(auth["driver_id"], &BADGE_HASH[..8]);

        let (_, alcohol) = rows.iter().find(|(e, _)| e == "alcohol").unwrap();
        assert_eq!(alcohol["result"], "pass");
        assert_eq!(alcohol["sensor_ok"], true);

        let (_, open) = rows.iter().find(|(e, _)| e == "trip_open").unwrap();
        assert_eq!(open["trip_id"], trip_id.as_str());
        assert_eq!(open["status"], "active");
        Uuid::parse_str(open["trip_id"].as_str().unwrap()).unwrap();

        let (_, close) = rows.iter().find(|(e, _)| e == "trip_close").unwrap();
        assert_eq!(close["trip_id"], trip_id.as_str());
        assert_eq!(close["status"], "stopped_by_button");

        // ordering property: the trip_open row precedes every telemetry
        // row that references the trip
        let open_id = outbox
            .dequeue_batch(500)
            .unwrap()
            .iter()
            .find(|item| item.endpoint == "trip_open")
            .unwrap()
            .id;
        for item in outbox.dequeue_batch(500).unwrap() {
            if item.endpoint == "telemetry" {
                let payload: Value = serde_json::from_str(&item.payload).unwrap();
                if !payload["points"][0]["trip_id"].is_null() {
                    assert!(item.id > open_id);
                }
            }
        }
    }

    #[test]
    /// A failed alcohol test blocks the trip, emits the fail event and
    /// the critical alert, and allows a retest.
    fn alcohol_fail_blocks_trip() {
        let config = test_config();
        let outbox = Outbox::open_in_memory().unwrap();
        let api = ApiClient::new("http://127.0.0.1:1", "RK-1", "aa55").unwrap();
        let (rig, devices) = rig_devices(vec![Badge::from_uid(&[0x04, 0xA1, 0xB2, 0xC3])]);
        let fatigue = FatigueWorker::new(FatigueConfig::default(), None);
        let mut controller =
            Controller::new(&config, &outbox, &api, devices, fatigue, status_map());

        // gas on the line during the whole test
        rig.gas.clone().write(false).unwrap();

        controller.tick().unwrap();
        controller.session.transition(TripState::Ready).unwrap();
        press(&mut controller, &rig, 0); // start -> auth -> badge consumed
        controller.tick().unwrap(); // warmup -> blow
        controller.tick().unwrap(); // blow -> verdict
        assert_eq!(controller.session.alcohol_phase, AlcoholPhase::Fail);

        let rows = rows(&outbox);
        let (_, alcohol) = rows.iter().find(|(e, _)| e == "alcohol").unwrap();
        assert_eq!(alcohol["result"], "fail");
        assert_eq!(alcohol["ttl_state"], false);

        let (_, alert) = rows.iter().find(|(e, _)| e == "alert").unwrap();
        assert_eq!(alert["alert_type"], "alcohol_fail");
        assert_eq!(alert["severity"], "critical");
        assert_eq!(alert["meta"]["driver_id"], &BADGE_HASH[..8]);

        // no trip was ever opened
        assert!(rows.iter().all(|(e, _)| e != "trip_open"));

        // start runs a retest from the warmup
        sleep(Duration::from_millis(210));
        press(&mut controller, &rig, 0);
        assert_eq!(controller.session.current(), TripState::AlcoholCheck);

        // clean air this time: the retest passes
        rig.gas.clone().write(true).unwrap();
        controller.tick().unwrap(); // warmup -> blow
        controller.tick().unwrap(); // verdict
        assert_eq!(controller.session.alcohol_phase, AlcoholPhase::Pass);
    }

    #[test]
    /// Fatigue level 2 raises exactly one alert per episode, within the
    /// tick that observes it; an uncalibrated snapshot never alerts.
    fn fatigue_alert_per_episode() {
        let config = test_config();
        let outbox = Outbox::open_in_memory().unwrap();
        let api = ApiClient::new("http://127.0.0.1:1", "RK-1", "aa55").unwrap();
        let (rig, devices) = rig_devices(vec![Badge::from_uid(&[0x04, 0xA1, 0xB2, 0xC3])]);
        let fatigue = FatigueWorker::new(FatigueConfig::default(), None);
        let snapshot = fatigue.snapshot_handle();
        let mut controller =
            Controller::new(&config, &outbox, &api, devices, fatigue, status_map());

        walk_to_trip(&mut controller, &rig);

        let fatigue_alerts = |outbox: &Outbox| {
            rows(outbox)
                .iter()
                .filter(|(e, payload)| e == "alert" && payload["alert_type"] == "fatigue_alert")
                .count()
        };

        // an uncalibrated level-2 snapshot must not alert
        {
            let mut snap = snapshot.lock().unwrap();
            snap.level = 2;
            snap.ok = false;
        }
        controller.tick().unwrap();
        assert_eq!(fatigue_alerts(&outbox), 0);

        // calibrated: one alert, once
        {
            let mut snap = snapshot.lock().unwrap();
            snap.level = 2;
            snap.is_microsleep = true;
            snap.ok = true;
        }
        controller.tick().unwrap();
        assert_eq!(fatigue_alerts(&outbox), 1);
        controller.tick().unwrap();
        controller.tick().unwrap();
        assert_eq!(fatigue_alerts(&outbox), 1, "episode must alert once");

        // recovery, then a second episode: a second alert
        {
            let mut snap = snapshot.lock().unwrap();
            snap.level = 0;
            snap.is_microsleep = false;
        }
        controller.tick().unwrap();
        {
            let mut snap = snapshot.lock().unwrap();
            snap.level = 2;
        }
        controller.tick().unwrap();
        assert_eq!(fatigue_alerts(&outbox), 2);

        let rows = rows(&outbox);
        let (_, alert) = rows
            .iter()
            .find(|(e, payload)| e == "alert" && payload["alert_type"] == "fatigue_alert")
            .unwrap();
        assert_eq!(alert["severity"], "critical");
        assert!(alert["trip_id"].is_string());
        assert_eq!(alert["meta"]["is_microsleep"], true);
    }

    #[test]
    /// Gas during a trip raises one alert per episode.
    fn gas_alert_during_trip() {
        let config = test_config();
        let outbox = Outbox::open_in_memory().unwrap();
        let api = ApiClient::new("http://127.0.0.1:1", "RK-1", "aa55").unwrap();
        let (rig, devices) = rig_devices(vec![Badge::from_uid(&[0x04, 0xA1, 0xB2, 0xC3])]);
        let fatigue = FatigueWorker::new(FatigueConfig::default(), None);
        let mut controller =
            Controller::new(&config, &outbox, &api, devices, fatigue, status_map());

        walk_to_trip(&mut controller, &rig);

        rig.gas.clone().write(false).unwrap();
        controller.tick().unwrap();
        controller.tick().unwrap();

        let gas_alerts: Vec<_> = rows(&outbox)
            .into_iter()
            .filter(|(e, payload)| e == "alert" && payload["alert_type"] == "gas_detected")
            .collect();
        assert_eq!(gas_alerts.len(), 1);
        assert_eq!(gas_alerts[0].1["severity"], "critical");
    }

    #[test]
    /// A cached badge resolves locally with `auth_result = success`.
    fn badge_cache_hit() {
        let config = test_config();
        let outbox = Outbox::open_in_memory().unwrap();
        outbox.cache_badge(BADGE_HASH, "D42", "Alice").unwrap();
        let api = ApiClient::new("http://127.0.0.1:1", "RK-1", "aa55").unwrap();
        let (rig, devices) = rig_devices(vec![Badge::from_uid(&[0x04, 0xA1, 0xB2, 0xC3])]);
        let fatigue = FatigueWorker::new(FatigueConfig::default(), None);
        let mut controller =
            Controller::new(&config, &outbox, &api, devices, fatigue, status_map());

        controller.tick().unwrap();
        controller.session.transition(TripState::Ready).unwrap();
        press(&mut controller, &rig, 0); // start -> auth -> badge consumed

        assert_eq!(controller.session.driver_id.as_deref(), Some("D42"));
        assert_eq!(controller.session.driver_name, "Alice");

        let rows = rows(&outbox);
        let (_, auth) = rows.iter().find(|(e, _)| e == "nfc_auth").unwrap();
        assert_eq!(auth["auth_result"], "success");
        assert_eq!(auth["driver_id"], "D42");
    }

    #[test]
    /// The auth prompt backs out to ready, and the menu cycles its four
    /// pages and returns to where it was opened from.
    fn auth_back_and_menu() {
        let config = test_config();
        let outbox = Outbox::open_in_memory().unwrap();
        let api = ApiClient::new("http://127.0.0.1:1", "RK-1", "aa55").unwrap();
        let (rig, devices) = rig_devices(vec![]);
        let fatigue = FatigueWorker::new(FatigueConfig::default(), None);
        let mut controller =
            Controller::new(&config, &outbox, &api, devices, fatigue, status_map());

        controller.tick().unwrap();
        controller.session.transition(TripState::Ready).unwrap();

        press(&mut controller, &rig, 0); // start -> auth (no badge scripted)
        assert_eq!(controller.session.current(), TripState::AuthNfc);
        press(&mut controller, &rig, 3); // back
        assert_eq!(controller.session.current(), TripState::Ready);

        press(&mut controller, &rig, 2); // menu
        assert_eq!(controller.session.current(), TripState::Menu);
        for expected_page in [1, 2, 3, 0] {
            sleep(Duration::from_millis(210));
            press(&mut controller, &rig, 2);
            assert_eq!(controller.session.menu_page, expected_page);
        }
        press(&mut controller, &rig, 3); // back -> ready
        assert_eq!(controller.session.current(), TripState::Ready);
        assert_eq!(controller.session.menu_page, 0);
    }

    #[test]
    /// Telemetry flows in ready and trip states, carries the trip id
    /// only during the trip, and respects its interval.
    fn telemetry_cadence() {
        let config = test_config();
        let outbox = Outbox::open_in_memory().unwrap();
        let api = ApiClient::new("http://127.0.0.1:1", "RK-1", "aa55").unwrap();
        let (rig, devices) = rig_devices(vec![Badge::from_uid(&[0x04, 0xA1, 0xB2, 0xC3])]);
        let fatigue = FatigueWorker::new(FatigueConfig::default(), None);
        let mut controller =
            Controller::new(&config, &outbox, &api, devices, fatigue, status_map());

        controller.tick().unwrap();
        controller.session.transition(TripState::Ready).unwrap();
        controller.tick().unwrap(); // first ready tick emits a point
        controller.tick().unwrap(); // within the interval: no second point

        let telemetry: Vec<_> = rows(&outbox)
            .into_iter()
            .filter(|(e, _)| e == "telemetry")
            .collect();
        assert_eq!(telemetry.len(), 1);
        let point = &telemetry[0].1["points"][0];
        assert!(point["trip_id"].is_null());
        assert_eq!(point["org_id"], "org-1");
        assert_eq!(point["network_type"], "UNKNOWN");

        // into a trip: the next point references the trip
        walk_to_trip(&mut controller, &rig);
        sleep(Duration::from_millis(1100));
        controller.tick().unwrap();

        let telemetry: Vec<_> = rows(&outbox)
            .into_iter()
            .filter(|(e, _)| e == "telemetry")
            .collect();
        let last_point = &telemetry.last().unwrap().1["points"][0];
        assert_eq!(
            last_point["trip_id"].as_str().unwrap(),
            controller.session.trip_id.unwrap().to_string()
        );
    }
}
