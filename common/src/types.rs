//! Definitions of the sensor data types exchanged between client and server

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// All sensor types known to the framework
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum SensorType {
    Accelerometer,
    Gyroscope,
    Magnetometer,
    LinearAcceleration,
    RotationVector,
    Orientation,
    GameRotationVector,
    Gravity,
}

impl SensorType {
    pub const ALL: [SensorType; 8] = [
        SensorType::Accelerometer,
        SensorType::Gyroscope,
        SensorType::Magnetometer,
        SensorType::LinearAcceleration,
        SensorType::RotationVector,
        SensorType::Orientation,
        SensorType::GameRotationVector,
        SensorType::Gravity,
    ];
}

impl Display for SensorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Requested update rate of a sensor on the client
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SensorSpeed {
    Fastest,
    Game,
    Ui,
    Normal,
}

impl SensorSpeed {
    /// Time between two samples the client should aim for
    pub fn interval(self) -> Duration {
        match self {
            SensorSpeed::Fastest => Duration::ZERO,
            SensorSpeed::Game => Duration::from_millis(20),
            SensorSpeed::Ui => Duration::from_millis(60),
            SensorSpeed::Normal => Duration::from_millis(200),
        }
    }
}

/// Per sensor scaling preference chosen by the user, between 0 and 100
pub type Sensitivity = f32;

pub const DEFAULT_SENSITIVITY: Sensitivity = 50.0;
pub const MAX_SENSITIVITY: u8 = 100;

/// A single sensor event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub sensor_type: SensorType,
    pub values: Vec<f32>,
    /// Capture time on the client, no ordering is guaranteed between samples
    pub timestamp_nanos: i64,
    pub accuracy: i32,
}

impl SensorSample {
    pub fn new(sensor_type: SensorType, values: Vec<f32>, timestamp_nanos: i64) -> Self {
        Self {
            sensor_type,
            values,
            timestamp_nanos,
            accuracy: -1,
        }
    }
}

impl Display for SensorSample {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.sensor_type)?;
        for value in &self.values {
            write!(f, "{value},")?;
        }
        write!(f, "{},{}", self.timestamp_nanos, self.accuracy)
    }
}
