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

//! The fatigue worker.
//!
//! The camera and the face detector live in a separate vision process;
//! what crosses into the firmware is a stream of per-frame
//! [`FrameObservation`]s behind the [`FrameSource`] trait. The worker
//! owns one thread consuming that stream: it calibrates for a few
//! seconds, then tracks nods, microsleeps and yawns, fuses them into a
//! level, and publishes a [`FatigueSnapshot`] under a mutex for the main
//! loop to copy out on every tick.

pub mod config;
pub mod fusion;
mod nod;
mod yawn;

use std::{
    io::{BufRead, BufReader, Read},
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use serde::Deserialize;

pub use config::FatigueConfig;

use crate::stop::StopToken;

/// How long `stop` waits for the pipeline thread before giving up on it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq)]
/// The worker's published view, copied out by readers.
pub struct FatigueSnapshot {
    /// 0 = normal, 1 = warning, 2 = alert.
    pub level: u8,
    /// Display name of the level.
    pub level_name: String,
    /// Nods inside the sliding window.
    pub nod_count: u32,
    /// Yawns since the pipeline started.
    pub yawn_count: u32,
    /// Whether the head is currently down past the microsleep threshold.
    pub is_microsleep: bool,
    /// Seconds of the head-down excursion in progress.
    pub head_down_sec: f64,
    /// Whether the last frame contained a face.
    pub face_detected: bool,
    /// Smoothed processing rate.
    pub fps: f64,
    /// False until calibration has finished; consumers must not act on
    /// the level while this is false.
    pub ok: bool,
}

impl Default for FatigueSnapshot {
    fn default() -> FatigueSnapshot {
        FatigueSnapshot {
            level: fusion::LEVEL_NORMAL,
            level_name: "NORMAL".into(),
            nod_count: 0,
            yawn_count: 0,
            is_microsleep: false,
            head_down_sec: 0.0,
            face_detected: false,
            fps: 0.0,
            ok: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
/// A face bounding box in frame pixels.
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
/// What the vision process reports about one camera frame.
pub struct FrameObservation {
    /// The largest detected face, if any.
    pub face: Option<FaceBox>,
    /// Mean pixel intensity of the mouth region of that face.
    pub mouth_intensity: Option<f64>,
    /// Height of the camera frame in pixels.
    pub frame_height: u32,
}

/// A source of per-frame observations. The boundary to the CV pipeline.
pub trait FrameSource {
    /// The next observation, or `None` if no frame arrived within
    /// `timeout`. Implementations must return within roughly the
    /// timeout so the worker can honor its stop token.
    fn next_frame(&mut self, timeout: Duration) -> Option<FrameObservation>;
}

/// A frame source reading newline-delimited JSON observations, one per
/// frame, from any byte stream.
///
/// The underlying reader must enforce its own read timeout (a serial
/// port or a socket with a receive timeout); the worker relies on that
/// to stay responsive to stop requests.
pub struct NdjsonFrames<R: Read> {
    reader: BufReader<R>,
    line: String,
}

impl<R: Read> NdjsonFrames<R> {
    pub fn new(stream: R) -> NdjsonFrames<R> {
        NdjsonFrames {
            reader: BufReader::new(stream),
            line: String::new(),
        }
    }
}

impl<R: Read> FrameSource for NdjsonFrames<R> {
    fn next_frame(&mut self, _timeout: Duration) -> Option<FrameObservation> {
        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => None,
            Ok(_) => match serde_json::from_str(self.line.trim()) {
                Ok(observation) => Some(observation),
                Err(e) => {
                    log::debug!("dropping malformed vision frame: {e}");
                    None
                }
            },
            Err(_) => None,
        }
    }
}

/// The fatigue worker. Owns the pipeline thread between `start` and
/// `stop`; the frame source is handed to the thread and handed back when
/// it exits, so the pipeline can be restarted for the next trip.
pub struct FatigueWorker {
    config: FatigueConfig,
    snapshot: Arc<Mutex<FatigueSnapshot>>,
    source: Option<Box<dyn FrameSource + Send>>,
    pipeline: Option<(StopToken, JoinHandle<Box<dyn FrameSource + Send>>)>,
}

impl FatigueWorker {
    #[must_use]
    /// Construct a worker. `source` is `None` on kits without a camera;
    /// such a worker never starts and its snapshot stays at the default.
    pub fn new(config: FatigueConfig, source: Option<Box<dyn FrameSource + Send>>) -> FatigueWorker {
        FatigueWorker {
            config,
            snapshot: Arc::new(Mutex::new(FatigueSnapshot::default())),
            source,
            pipeline: None,
        }
    }

    #[must_use]
    /// Whether a camera source is available at all.
    pub fn is_present(&self) -> bool {
        self.source.is_some() || self.pipeline.is_some()
    }

    #[must_use]
    /// Whether the pipeline thread is currently running.
    pub fn is_running(&self) -> bool {
        self.pipeline
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Spawn the pipeline thread. Returns whether it is now running.
    /// Starting an already-running worker is a no-op.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            return true;
        }
        // a finished pipeline must be reaped first to recover the source
        self.stop();

        let Some(source) = self.source.take() else {
            return false;
        };

        *self
            .snapshot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = FatigueSnapshot::default();

        let token = StopToken::new();
        let thread_token = token.clone();
        let config = self.config.clone();
        let snapshot = Arc::clone(&self.snapshot);
        let handle = std::thread::Builder::new()
            .name("fatigue".into())
            .spawn(move || run_pipeline(source, &config, &snapshot, &thread_token));

        match handle {
            Ok(handle) => {
                self.pipeline = Some((token, handle));
                true
            }
            Err(e) => {
                log::error!("could not spawn fatigue pipeline: {e}");
                false
            }
        }
    }

    /// Signal the pipeline to stop and join it, with a timeout.
    /// If the thread does not come back in time it is abandoned and the
    /// frame source is lost; a later `start` will then report `false`.
    pub fn stop(&mut self) {
        let Some((token, handle)) = self.pipeline.take() else {
            return;
        };
        token.stop();

        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        if handle.is_finished() {
            if let Ok(source) = handle.join() {
                self.source = Some(source);
            }
        } else {
            log::warn!("fatigue pipeline did not stop within {JOIN_TIMEOUT:?}, abandoning it");
        }
    }

    #[must_use]
    /// A copy of the current snapshot.
    pub fn read(&self) -> FatigueSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Direct access to the published snapshot, for tests that need to
    /// script pipeline output without a camera.
    #[cfg(test)]
    pub(crate) fn snapshot_handle(&self) -> Arc<Mutex<FatigueSnapshot>> {
        Arc::clone(&self.snapshot)
    }
}

/// The pipeline thread: calibrate, then detect until stopped.
/// Returns the frame source so the worker can run again later.
fn run_pipeline(
    mut source: Box<dyn FrameSource + Send>,
    config: &FatigueConfig,
    snapshot: &Mutex<FatigueSnapshot>,
    token: &StopToken,
) -> Box<dyn FrameSource + Send> {
    let mut nod = nod::NodTracker::new(config.clone());
    let mut yawn = yawn::YawnDetector::new(config.clone());

    // calibration: learn the resting head position and the closed-mouth
    // intensity
    let calibration_start = Instant::now();
    while !token.is_stopped() {
        let elapsed = calibration_start.elapsed().as_secs_f64();
        if elapsed >= config.calibration_sec
            && nod.calibration_samples() >= config.calibration_min_samples
        {
            break;
        }

        let Some(observation) = source.next_frame(Duration::from_millis(500)) else {
            if token.wait_timeout(Duration::from_millis(50)) {
                return source;
            }
            continue;
        };
        if let Some(face) = observation.face {
            nod.add_calibration_sample(&face, observation.frame_height);
            if let Some(intensity) = observation.mouth_intensity {
                yawn.add_baseline_sample(intensity);
            }
        }
    }
    if token.is_stopped() {
        return source;
    }
    nod.finalize_baseline();
    yawn.finalize_baseline();
    log::info!(
        "fatigue calibration done ({} samples)",
        nod.calibration_samples()
    );

    // steady-state detection
    let mut fps = 0.0_f64;
    let mut first_frame = true;
    while !token.is_stopped() {
        let frame_start = Instant::now();
        let Some(observation) = source.next_frame(Duration::from_millis(500)) else {
            if token.wait_timeout(Duration::from_millis(50)) {
                break;
            }
            continue;
        };

        let now = Instant::now();
        nod.update(observation.face.as_ref(), observation.frame_height, now);
        if observation.face.is_some() {
            if let Some(intensity) = observation.mouth_intensity {
                yawn.update(intensity, now);
            }
        }

        let nod_count = nod.count(now);
        let level = fusion::fuse(config, nod_count, nod.is_microsleep(), yawn.count());

        let dt = frame_start.elapsed().as_secs_f64();
        let instant_fps = if dt > 0.0 { 1.0 / dt } else { 0.0 };
        fps = if first_frame {
            instant_fps
        } else {
            fps * 0.9 + instant_fps * 0.1
        };
        first_frame = false;

        *snapshot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = FatigueSnapshot {
            level,
            level_name: fusion::level_name(level).into(),
            nod_count,
            yawn_count: yawn.count(),
            is_microsleep: nod.is_microsleep(),
            head_down_sec: nod.head_down_duration(now),
            face_detected: observation.face.is_some(),
            fps: (fps * 10.0).round() / 10.0,
            ok: true,
        };
    }

    // leave a quiet snapshot behind so a stopped pipeline cannot keep an
    // alert latched
    *snapshot
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = FatigueSnapshot::default();
    source
}
