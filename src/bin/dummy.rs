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

use roadkit::{run::Dummy, stop::StopToken, KitError};

/// A dummy main function for roadkit.
/// Hardware is substituted for dummy values so that the firmware can be
/// exercised on non-production hardware: it boots, buffers telemetry and
/// syncs, but never sees a badge or a camera.
///
/// # Arguments
///
/// The first argument to this executable (via `std::env::args`) is the
/// path to a configuration JSON file.
fn main() -> Result<(), KitError> {
    env_logger::init();
    roadkit::run::run::<Dummy>(&StopToken::new())
}
