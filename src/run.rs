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

//! Bringing the whole kit up: hardware acquisition, worker threads, and
//! the main loop.
//!
//! Hardware is created through the [`MakeHardware`] trait so that the
//! entire firmware also runs against spoofed hardware, both in the test
//! suite and through the `dummy` binary on a development machine.

use std::{
    collections::BTreeMap,
    fs::File,
    io::BufReader,
    time::Duration,
};

use gpio_cdev::{Chip, LineHandle, LineRequestFlags};

use crate::{
    config::Configuration,
    control::{Controller, Devices},
    display::{ConsolePanel, Panel},
    fatigue::{FatigueConfig, FatigueWorker, FrameSource, NdjsonFrames},
    hardware::{
        buttons::ButtonPad,
        buzzer::Buzzer,
        dht22::Dht22,
        gas::GasSensor,
        gps::GpsDriver,
        led::RgbLed,
        nfc::{AbsentNfc, NfcReader, Pn532Uart},
        GpioPin, ListenerPin,
    },
    outbox::Outbox,
    stop::StopToken,
    sync::{sync_loop, ApiClient},
    KitError,
};

/// A trait for functions which can create the necessary hardware for the
/// kit to run.
///
/// This exists to allow us to "spoof" hardware for the main process so we
/// don't have to test everything on real hardware.
pub trait MakeHardware {
    /// The type of the chip, which can be used for getting a GPIO pin.
    type Chip;
    /// The type of GPIO pin that this trait can make.
    type Pin: GpioPin + Send + 'static;

    /// Construct a GPIO chip which can be used to get pins.
    ///
    /// # Errors
    ///
    /// This function will return an error if constructing the chip fails.
    fn chip() -> Result<Self::Chip, KitError>;

    /// Acquire an input line with its pull-up enabled where supported.
    ///
    /// # Errors
    ///
    /// This function will return an error if the line cannot be acquired.
    fn input(chip: &mut Self::Chip, pin: u8) -> Result<Self::Pin, KitError>;

    /// Acquire an output line, initially low.
    ///
    /// # Errors
    ///
    /// This function will return an error if the line cannot be acquired.
    fn output(chip: &mut Self::Chip, pin: u8) -> Result<Self::Pin, KitError>;

    /// Acquire the open-drain line of the single-wire temperature
    /// sensor, initially released.
    ///
    /// # Errors
    ///
    /// This function will return an error if the line cannot be acquired.
    fn open_drain(chip: &mut Self::Chip, pin: u8) -> Result<Self::Pin, KitError>;

    /// Open the badge reader, if the kit has one.
    fn nfc(config: &Configuration) -> Option<Box<dyn NfcReader + Send>>;

    /// Bring up the GNSS/cellular modem driver.
    fn gps(config: &Configuration, stop: StopToken) -> GpsDriver;

    /// Connect to the vision process, if the kit has a camera.
    fn frame_source(config: &Configuration) -> Option<Box<dyn FrameSource + Send>>;

    /// The panel implementation for this hardware.
    fn panel() -> Box<dyn Panel + Send>;
}

/// A hardware maker for actually interfacing with the Raspberry Pi.
pub struct RaspberryPi;

impl MakeHardware for RaspberryPi {
    type Chip = Chip;
    type Pin = LineHandle;

    fn chip() -> Result<Self::Chip, KitError> {
        Ok(Chip::new("/dev/gpiochip0")?)
    }

    fn input(chip: &mut Self::Chip, pin: u8) -> Result<Self::Pin, KitError> {
        Ok(chip
            .get_line(u32::from(pin))?
            .request(LineRequestFlags::INPUT, 0, "roadkit")?)
    }

    fn output(chip: &mut Self::Chip, pin: u8) -> Result<Self::Pin, KitError> {
        Ok(chip
            .get_line(u32::from(pin))?
            .request(LineRequestFlags::OUTPUT, 0, "roadkit")?)
    }

    fn open_drain(chip: &mut Self::Chip, pin: u8) -> Result<Self::Pin, KitError> {
        Ok(chip.get_line(u32::from(pin))?.request(
            LineRequestFlags::OUTPUT | LineRequestFlags::OPEN_DRAIN,
            1,
            "roadkit",
        )?)
    }

    fn nfc(config: &Configuration) -> Option<Box<dyn NfcReader + Send>> {
        let port = config.nfc_port.as_deref()?;
        let reader = Pn532Uart::open(port, 115_200)?;
        Some(Box::new(reader))
    }

    fn gps(config: &Configuration, stop: StopToken) -> GpsDriver {
        GpsDriver::start(
            &config.gps_nmea_port,
            &config.gps_at_port,
            config.gps_baud,
            stop,
        )
    }

    fn frame_source(config: &Configuration) -> Option<Box<dyn FrameSource + Send>> {
        let path = config.vision_stream_path.as_deref()?;
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(stream) => {
                // the pipeline thread polls this stream; a read timeout
                // keeps it responsive to its stop token
                stream
                    .set_read_timeout(Some(Duration::from_millis(500)))
                    .ok()?;
                Some(Box::new(NdjsonFrames::new(stream)))
            }
            Err(e) => {
                log::warn!("vision stream {path} unavailable: {e}");
                None
            }
        }
    }

    fn panel() -> Box<dyn Panel + Send> {
        Box::new(ConsolePanel::default())
    }
}

/// A dummy hardware maker for testing on any Linux computer.
pub struct Dummy;

impl MakeHardware for Dummy {
    type Chip = ();
    type Pin = ListenerPin;

    fn chip() -> Result<Self::Chip, KitError> {
        Ok(())
    }

    fn input(_: &mut Self::Chip, _: u8) -> Result<Self::Pin, KitError> {
        // idle high: buttons released, gas line clean
        Ok(ListenerPin::new(true))
    }

    fn output(_: &mut Self::Chip, _: u8) -> Result<Self::Pin, KitError> {
        Ok(ListenerPin::new(false))
    }

    fn open_drain(_: &mut Self::Chip, _: u8) -> Result<Self::Pin, KitError> {
        Ok(ListenerPin::new(true))
    }

    fn nfc(_: &Configuration) -> Option<Box<dyn NfcReader + Send>> {
        None
    }

    fn gps(_: &Configuration, _: StopToken) -> GpsDriver {
        GpsDriver::absent()
    }

    fn frame_source(_: &Configuration) -> Option<Box<dyn FrameSource + Send>> {
        None
    }

    fn panel() -> Box<dyn Panel + Send> {
        Box::new(ConsolePanel::default())
    }
}

/// The primary run function for the kit.
///
/// `M` is a dependency-injector for creating hardware. The function
/// returns when `stop` fires or the outbox store fails.
///
/// # Arguments
///
/// The first argument to this executable (via `std::env::args`) is the
/// path to a configuration JSON file.
///
/// # Errors
///
/// This function can return any of the possible errors in `KitError`.
pub fn run<M: MakeHardware>(stop: &StopToken) -> Result<(), KitError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let json_path = args
        .first()
        .ok_or(KitError::Args("no configuration JSON path given"))?;

    log::info!("roadkit v{} starting", crate::FW_VERSION);

    let config_file = File::open(json_path)?;
    let config = match Configuration::parse(&mut BufReader::new(config_file)) {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration rejected: {e}");
            // an unprovisioned kit must not pretend to work: sound the
            // error pattern and hold until the operator intervenes
            config_failure_hold::<M>(stop);
            return Err(e.into());
        }
    };
    log::info!(
        "kit {} for org {}, API {}",
        config.kit_serial,
        config.org_id,
        config.api_base_url
    );

    let outbox = Outbox::open(&config.db_path)?;
    let api = ApiClient::new(&config.api_base_url, &config.kit_serial, &config.kit_key)?;

    // acquire hardware; every failure degrades to an absent driver and a
    // false entry in the boot health report
    let mut status = BTreeMap::new();
    let mut chip = match M::chip() {
        Ok(chip) => Some(chip),
        Err(e) => {
            log::warn!("GPIO chip unavailable: {e}");
            None
        }
    };

    let gps = M::gps(&config, stop.clone());
    status.insert("GPS".to_string(), gps.is_present());

    let env = match acquire(&mut chip, config.pin_dht, M::open_drain) {
        Some(pin) => Dht22::new(pin),
        None => Dht22::absent(),
    };
    status.insert("TEMP".to_string(), env.is_present());

    let gas = match acquire(&mut chip, config.pin_gas, M::input) {
        Some(pin) => GasSensor::new(pin),
        None => GasSensor::absent(),
    };
    status.insert("GAS".to_string(), gas.is_present());

    let buzzer = match acquire(&mut chip, config.pin_buzzer, M::output) {
        Some(pin) => Buzzer::new(pin, config.buzzer_freq_hz),
        None => Buzzer::absent(),
    };
    status.insert("BUZZER".to_string(), buzzer.is_present());

    let [red, green, blue] = config.pins_led;
    let led = match (
        acquire(&mut chip, red, M::output),
        acquire(&mut chip, green, M::output),
        acquire(&mut chip, blue, M::output),
    ) {
        (Some(red), Some(green), Some(blue)) => RgbLed::new([red, green, blue]),
        _ => RgbLed::absent(),
    };
    status.insert("LED".to_string(), led.is_present());

    let [start, stop_btn, menu, back] = config.pins_buttons;
    let buttons = match (
        acquire(&mut chip, start, M::input),
        acquire(&mut chip, stop_btn, M::input),
        acquire(&mut chip, menu, M::input),
        acquire(&mut chip, back, M::input),
    ) {
        (Some(start), Some(stop_btn), Some(menu), Some(back)) => {
            ButtonPad::new([start, stop_btn, menu, back])
        }
        _ => ButtonPad::absent(),
    };
    status.insert("BTN".to_string(), buttons.is_present());

    let nfc: Box<dyn NfcReader + Send> = match M::nfc(&config) {
        Some(reader) => {
            status.insert("NFC".to_string(), true);
            reader
        }
        None => {
            status.insert("NFC".to_string(), false);
            Box::new(AbsentNfc)
        }
    };

    let fatigue = FatigueWorker::new(FatigueConfig::default(), M::frame_source(&config));
    status.insert("CAM".to_string(), fatigue.is_present());

    status.insert("OLED".to_string(), true);

    for (name, ok) in &status {
        log::info!("  {} {name}", if *ok { "up  " } else { "DOWN" });
    }

    let devices = Devices {
        gps,
        env,
        gas,
        nfc,
        buzzer,
        led,
        buttons,
        panel: M::panel(),
    };
    let mut controller = Controller::new(&config, &outbox, &api, devices, fatigue, status);

    std::thread::scope(|scope| {
        let outbox = &outbox;
        let api = &api;
        let sync_stop = stop.clone();
        let batch_size = config.batch_size;
        let interval = config.sync_interval();
        scope.spawn(move || sync_loop(outbox, api, batch_size, interval, &sync_stop));

        let result = controller.run_loop(stop);
        // wind every worker down, whatever ended the loop
        stop.stop();
        result
    })
}

/// Try to acquire one line, degrading a failure into `None`.
fn acquire<C, P>(
    chip: &mut Option<C>,
    pin: u8,
    getter: impl Fn(&mut C, u8) -> Result<P, KitError>,
) -> Option<P> {
    let chip = chip.as_mut()?;
    match getter(chip, pin) {
        Ok(line) => Some(line),
        Err(e) => {
            log::warn!("GPIO {pin} unavailable: {e}");
            None
        }
    }
}

/// The configuration was rejected: play the error pattern on the default
/// buzzer pin and hold until asked to stop.
fn config_failure_hold<M: MakeHardware>(stop: &StopToken) {
    if let Ok(mut chip) = M::chip() {
        if let Ok(pin) = M::output(&mut chip, 27) {
            let buzzer = Buzzer::new(pin, 2000);
            buzzer.play(crate::hardware::buzzer::Pattern::Error);
        }
    }
    while !stop.is_stopped() {
        stop.wait_timeout(Duration::from_secs(1));
    }
}
