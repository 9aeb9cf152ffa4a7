//! Wire encoding of identities, samples and command frames

use crate::identity::DeviceIdentity;
use crate::protocol::Command;
use crate::types::SensorSample;
use anyhow::{bail, Context};
use serde::Serialize;
use thiserror::Error;

/// Largest datagram used on the discovery and data channels
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Largest command frame payload accepted on a command channel
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

pub const HEADER_SIZE: usize = 4;

#[derive(Error, Debug)]
pub enum DatagramError {
    #[error("Encoded datagram of {0} bytes does not fit in {MAX_DATAGRAM_SIZE} bytes")]
    Oversized(usize),
    #[error("Could not encode datagram: {0}")]
    Encode(#[from] bincode::Error),
}

/// Encodes `value` into a single datagram, values that do not fit are rejected instead of truncated
pub fn encode_datagram<T: Serialize>(value: &T) -> Result<Vec<u8>, DatagramError> {
    let bytes = bincode::serialize(value)?;
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(DatagramError::Oversized(bytes.len()));
    }

    Ok(bytes)
}

pub fn encode_identity(identity: &DeviceIdentity) -> Result<Vec<u8>, DatagramError> {
    encode_datagram(identity)
}

pub fn decode_identity(bytes: &[u8]) -> anyhow::Result<DeviceIdentity> {
    bincode::deserialize(bytes).context("Decode identity")
}

pub fn encode_sample(sample: &SensorSample) -> Result<Vec<u8>, DatagramError> {
    encode_datagram(sample)
}

pub fn decode_sample(bytes: &[u8]) -> anyhow::Result<SensorSample> {
    bincode::deserialize(bytes).context("Decode sample")
}

/// Appends a length prefixed command to `buffer`
pub fn write_frame(command: &Command, buffer: &mut Vec<u8>) -> anyhow::Result<usize> {
    let payload: Vec<u8> = command.try_into()?;
    if payload.len() > MAX_FRAME_SIZE {
        bail!("Command of {} bytes exceeds the frame limit", payload.len());
    }

    let header = u32::try_from(payload.len()).context("Frame length")?;
    buffer.extend_from_slice(&header.to_le_bytes());
    buffer.extend_from_slice(&payload);

    Ok(HEADER_SIZE + payload.len())
}

/// Reads the length of the next frame without consuming it
pub fn peek_frame_len(buffer: &[u8]) -> Option<usize> {
    let header: [u8; HEADER_SIZE] = buffer.get(..HEADER_SIZE)?.try_into().ok()?;

    Some(u32::from_le_bytes(header) as usize)
}

/// Removes the next complete frame from `buffer`, `Ok(None)` if more data is needed
pub fn take_frame(buffer: &mut Vec<u8>) -> anyhow::Result<Option<Vec<u8>>> {
    let Some(len) = peek_frame_len(buffer) else {
        return Ok(None);
    };

    if len > MAX_FRAME_SIZE {
        bail!("Frame header announces {len} bytes, more than the frame limit");
    }

    if buffer.len() < HEADER_SIZE + len {
        return Ok(None);
    }

    let frame = buffer[HEADER_SIZE..HEADER_SIZE + len].to_vec();
    buffer.drain(..HEADER_SIZE + len);

    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SensorType;

    #[test]
    fn read_five_frames() {
        let commands = [
            Command::ResetToCenter,
            Command::ButtonClick { id: 3, is_hold: true },
            Command::UpdateButtonLayout {
                definition: "<LinearLayout/>".to_owned(),
            },
            Command::ChangeSensorSensitivity {
                sensor_type: SensorType::Gyroscope,
                value: 80,
            },
            Command::EndConnection,
        ];

        let mut buffer = Vec::new();
        for command in &commands {
            write_frame(command, &mut buffer).expect("Write fail");
        }

        for command in &commands {
            let frame = take_frame(&mut buffer).expect("Read fail").expect("Read fail (ended)");
            assert_eq!(&Command::try_from(&frame[..]).expect("Decode fail"), command);
        }

        assert!(buffer.is_empty());
    }

    #[test]
    fn split_frame_waits_for_more_data() {
        let mut full = Vec::new();
        write_frame(&Command::ButtonClick { id: 1, is_hold: false }, &mut full).unwrap();

        let mut buffer = full[..full.len() - 1].to_vec();
        assert_eq!(take_frame(&mut buffer).unwrap(), None);

        // Partial header
        let mut short = full[..2].to_vec();
        assert_eq!(take_frame(&mut short).unwrap(), None);

        buffer.push(*full.last().unwrap());
        assert!(take_frame(&mut buffer).unwrap().is_some());
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut buffer = (u32::MAX).to_le_bytes().to_vec();

        assert!(take_frame(&mut buffer).is_err());
    }

    #[test]
    fn oversized_sample_is_rejected() {
        let sample = SensorSample::new(SensorType::Accelerometer, vec![0.0; 512], 0);

        assert!(matches!(
            encode_sample(&sample),
            Err(DatagramError::Oversized(len)) if len > MAX_DATAGRAM_SIZE
        ));
    }

    #[test]
    fn sample_fits_datagram() {
        let sample = SensorSample::new(SensorType::Accelerometer, vec![1.0, 2.0, 3.0], 99);
        let bytes = encode_sample(&sample).unwrap();

        assert!(bytes.len() <= MAX_DATAGRAM_SIZE);
        assert_eq!(decode_sample(&bytes).unwrap(), sample);
    }
}
