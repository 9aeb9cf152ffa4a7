use std::time::Duration;

use common::types::{SensorSample, SensorType};
use rand::{rngs::ThreadRng, Rng};

/// Produces slow sine movements with a bit of noise on top
pub struct SensorSimulator {
    rng: ThreadRng,
}

impl SensorSimulator {
    pub fn new() -> Self {
        Self {
            rng: rand::thread_rng(),
        }
    }

    /// Largest absolute value a sensor reports
    pub fn range(&self, sensor_type: SensorType) -> f32 {
        match sensor_type {
            SensorType::Accelerometer | SensorType::LinearAcceleration | SensorType::Gravity => 19.6,
            SensorType::Gyroscope => 34.9,
            SensorType::Magnetometer => 2000.0,
            SensorType::RotationVector | SensorType::GameRotationVector => 1.0,
            SensorType::Orientation => 360.0,
        }
    }

    pub fn sample(&mut self, sensor_type: SensorType, elapsed: Duration) -> SensorSample {
        let range = self.range(sensor_type);
        let t = elapsed.as_secs_f32();

        let values = (0..3)
            .map(|axis| {
                let phase = axis as f32 * 2.1;
                let noise = self.rng.gen_range(-0.02f32..0.02) * range;
                ((t * 0.5 + phase).sin() * range * 0.3 + noise).clamp(-range, range)
            })
            .collect();

        let mut sample = SensorSample::new(sensor_type, values, elapsed.as_nanos() as i64);
        sample.accuracy = 3;
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_stay_in_range() {
        let mut simulator = SensorSimulator::new();

        for sensor_type in SensorType::ALL {
            let range = simulator.range(sensor_type);
            for step in 0..50 {
                let sample = simulator.sample(sensor_type, Duration::from_millis(step * 137));

                assert_eq!(sample.sensor_type, sensor_type);
                assert_eq!(sample.values.len(), 3);
                assert!(sample.values.iter().all(|value| value.abs() <= range));
            }
        }
    }
}
