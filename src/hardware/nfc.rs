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

//! Driver for the NFC badge reader.
//!
//! Badges identify drivers. The kit never stores a raw uid anywhere it
//! could leak: the uid is hashed on the spot and everything downstream
//! (badge cache, auth events) works on the hash.
//!
//! The concrete reader is a PN532 wired to a UART; its host frame format
//! is implemented just far enough for `SAMConfiguration` and
//! `InListPassiveTarget`, which is all a badge reader needs.

use std::{
    io::{Read, Write},
    time::{Duration, Instant},
};

use sha2::{Digest, Sha256};

#[derive(Clone, Debug, PartialEq, Eq)]
/// One presented badge.
pub struct Badge {
    /// The raw uid bytes, kept for hashing only.
    pub uid_bytes: Vec<u8>,
    /// The uid as colon-separated uppercase hex, for display.
    pub uid_hex: String,
    /// Lowercase hex SHA-256 of the raw uid bytes; the identity used by
    /// the badge cache and the auth events.
    pub uid_hash: String,
}

impl Badge {
    #[must_use]
    /// Build a badge from raw uid bytes.
    pub fn from_uid(uid: &[u8]) -> Badge {
        let uid_hex = uid
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(":");
        let uid_hash = hex_digest(uid);
        Badge {
            uid_bytes: uid.to_vec(),
            uid_hex,
            uid_hash,
        }
    }
}

/// Lowercase hex SHA-256 of `data`.
fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// The capability every badge reader offers the state machine.
pub trait NfcReader {
    /// Wait up to `timeout` for a badge. Returns `None` if no badge was
    /// presented in time; must not overrun the timeout by more than a few
    /// tens of milliseconds.
    fn scan(&mut self, timeout: Duration) -> Option<Badge>;
}

/// The reader of a kit with no NFC hardware fitted. Never sees a badge.
pub struct AbsentNfc;

impl NfcReader for AbsentNfc {
    fn scan(&mut self, _: Duration) -> Option<Badge> {
        None
    }
}

/// A PN532 behind a UART.
pub struct Pn532Uart {
    port: Box<dyn serialport::SerialPort>,
}

/// The PN532 host-to-controller frame direction byte.
const TFI_OUT: u8 = 0xD4;
/// The controller-to-host direction byte.
const TFI_IN: u8 = 0xD5;

impl Pn532Uart {
    /// Open and configure the reader. Returns `None` (after logging) if
    /// the port cannot be opened or the chip does not acknowledge
    /// `SAMConfiguration`, so a missing reader degrades to `AbsentNfc`
    /// behavior at the call site.
    #[must_use]
    pub fn open(port_name: &str, baud: u32) -> Option<Pn532Uart> {
        let port = serialport::new(port_name, baud)
            .timeout(Duration::from_millis(100))
            .open();
        let port = match port {
            Ok(port) => port,
            Err(e) => {
                log::warn!("NFC port {port_name} unavailable: {e}");
                return None;
            }
        };

        let mut reader = Pn532Uart { port };
        // a long preamble wakes the chip out of low-power UART mode
        reader.port.write_all(&[0x55, 0x55, 0x00, 0x00, 0x00]).ok()?;

        // normal mode, 1 s virtual card timeout
        let sam = [0x14, 0x01, 0x14, 0x01];
        let response = reader.command(&sam, Duration::from_millis(500))?;
        if response.first() != Some(&0x15) {
            log::warn!("PN532 rejected SAMConfiguration");
            return None;
        }
        Some(reader)
    }

    /// Send one command and return the response payload (the bytes after
    /// the `TFI` byte), or `None` on timeout or framing error.
    fn command(&mut self, data: &[u8], timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        self.port.write_all(&build_frame(data)).ok()?;

        // the chip first acks the frame, then answers; both arrive as
        // frames and the ack has a zero-length body
        loop {
            let payload = self.read_frame(deadline)?;
            if !payload.is_empty() {
                return Some(payload);
            }
        }
    }

    /// Read one frame from the wire, skipping to its start marker.
    /// Returns the payload after `TFI`, or an empty vector for an ack.
    fn read_frame(&mut self, deadline: Instant) -> Option<Vec<u8>> {
        // hunt for the 00 FF start-of-frame marker
        let mut previous = 0x00_u8;
        loop {
            let byte = self.read_byte(deadline)?;
            if previous == 0x00 && byte == 0xFF {
                break;
            }
            previous = byte;
        }

        let len = self.read_byte(deadline)?;
        let lcs = self.read_byte(deadline)?;
        if len == 0x00 && lcs == 0xFF {
            return Some(Vec::new()); // ack frame
        }
        if len.wrapping_add(lcs) != 0 {
            return None;
        }

        let mut body = vec![0_u8; usize::from(len)];
        for slot in &mut body {
            *slot = self.read_byte(deadline)?;
        }
        let dcs = self.read_byte(deadline)?;
        let sum = body.iter().fold(dcs, |acc, byte| acc.wrapping_add(*byte));
        if sum != 0 || body.first() != Some(&TFI_IN) {
            return None;
        }

        Some(body[1..].to_vec())
    }

    /// Read a single byte, retrying through port timeouts until the
    /// deadline passes.
    fn read_byte(&mut self, deadline: Instant) -> Option<u8> {
        let mut buffer = [0_u8; 1];
        loop {
            match self.port.read(&mut buffer) {
                Ok(1) => return Some(buffer[0]),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(_) => return None,
            }
            if Instant::now() >= deadline {
                return None;
            }
        }
    }
}

impl NfcReader for Pn532Uart {
    fn scan(&mut self, timeout: Duration) -> Option<Badge> {
        // list one ISO14443A target
        let response = self.command(&[0x4A, 0x01, 0x00], timeout)?;
        parse_target(&response).map(|uid| Badge::from_uid(&uid))
    }
}

/// Wrap command data into a PN532 host frame.
fn build_frame(data: &[u8]) -> Vec<u8> {
    let len = (data.len() + 1) as u8;
    let mut frame = vec![0x00, 0x00, 0xFF, len, len.wrapping_neg(), TFI_OUT];
    frame.extend_from_slice(data);
    let sum = data
        .iter()
        .fold(TFI_OUT, |acc, byte| acc.wrapping_add(*byte));
    frame.push(sum.wrapping_neg());
    frame.push(0x00);
    frame
}

/// Pull the uid out of an `InListPassiveTarget` response payload.
fn parse_target(response: &[u8]) -> Option<Vec<u8>> {
    // layout: 0x4B, target count, target number, SENS_RES (2), SEL_RES,
    // uid length, uid bytes
    if response.len() < 7 || response[0] != 0x4B || response[1] == 0 {
        return None;
    }
    let uid_len = usize::from(response[6]);
    if response.len() < 7 + uid_len {
        return None;
    }
    Some(response[7..7 + uid_len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Test the badge digest against a known vector.
    fn badge_hash() {
        let badge = Badge::from_uid(&[0x04, 0xA1, 0xB2, 0xC3]);
        assert_eq!(badge.uid_hex, "04:A1:B2:C3");
        assert_eq!(
            badge.uid_hash,
            "461b5a59324397cd78a3868910a48a7a89b7694fe7187590e823a2f3bb8f5adf"
        );
        assert_eq!(badge.uid_bytes, vec![0x04, 0xA1, 0xB2, 0xC3]);
    }

    #[test]
    /// Test host frame construction against the PN532 manual example.
    fn frame_layout() {
        assert_eq!(
            build_frame(&[0x4A, 0x01, 0x00]),
            vec![0x00, 0x00, 0xFF, 0x04, 0xFC, 0xD4, 0x4A, 0x01, 0x00, 0xE1, 0x00]
        );
    }

    #[test]
    /// Test uid extraction from a card response.
    fn target_parsing() {
        let response = [
            0x4B, 0x01, 0x01, 0x00, 0x04, 0x08, 0x04, 0x04, 0xA1, 0xB2, 0xC3,
        ];
        assert_eq!(
            parse_target(&response),
            Some(vec![0x04, 0xA1, 0xB2, 0xC3])
        );

        // no target in field
        assert_eq!(parse_target(&[0x4B, 0x00]), None);
        // truncated uid
        assert_eq!(parse_target(&[0x4B, 0x01, 0x01, 0x00, 0x04, 0x08, 0x07, 0x04]), None);
    }

    #[test]
    /// Test that the absent reader never produces a badge, promptly.
    fn absent_scans_nothing() {
        let start = std::time::Instant::now();
        assert_eq!(AbsentNfc.scan(Duration::from_millis(300)), None);
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
