//! Per-cycle ranging output and its wire frame.

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use super::tof::TofMeasurement;
use crate::asic::SampleBlock;

/// One direction of a pitch/catch pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathReport {
    pub tof: TofMeasurement,
    /// Calibration of the receiving chip used for the conversion.
    pub calibration: u16,
    pub block: SampleBlock,
}

/// Air speed along the path and speed of sound, from a pair of opposite
/// flight times over a known distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindEstimate {
    /// Positive when the air moves from A towards B.
    pub wind_mps: f64,
    pub sound_speed_mps: f64,
}

impl WindEstimate {
    pub fn from_tofs(path_length_m: f64, tof_ab_us: f64, tof_ba_us: f64) -> Option<Self> {
        if !(tof_ab_us > 0.0 && tof_ba_us > 0.0 && path_length_m > 0.0) {
            return None;
        }
        let forward = 1e6 / tof_ab_us;
        let backward = 1e6 / tof_ba_us;
        let half = path_length_m / 2.0;
        Some(Self {
            wind_mps: half * (forward - backward),
            sound_speed_mps: half * (forward + backward),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangingReport {
    pub cycle: u32,
    pub timestamp_us: u64,
    pub a_to_b: PathReport,
    pub b_to_a: PathReport,
    pub wind: Option<WindEstimate>,
}

impl RangingReport {
    /// Encode as a postcard frame for a host link.
    pub fn to_frame(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_frame(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::IqSample;

    fn path(tof_us: f64) -> PathReport {
        let mut samples = [IqSample::default(); 16];
        samples[8] = IqSample { q: -300, i: 400 };
        PathReport {
            tof: TofMeasurement {
                start_index: 7,
                end_index: 8,
                crossing: 7.5,
                frequency_khz: 300.0,
                tof_us,
            },
            calibration: 48_000,
            block: SampleBlock {
                scale_factor: 2048,
                chip_tof: 60,
                intensity: 500,
                samples,
            },
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let report = RangingReport {
            cycle: 7,
            timestamp_us: 1_234_567,
            a_to_b: path(172.4),
            b_to_a: path(177.6),
            wind: WindEstimate::from_tofs(0.06, 172.4, 177.6),
        };

        let frame = report.to_frame().unwrap();
        assert_eq!(RangingReport::from_frame(&frame).unwrap(), report);
    }

    #[test]
    fn test_wind_sign_follows_faster_direction() {
        let downwind = WindEstimate::from_tofs(0.06, 170.0, 180.0).unwrap();
        assert!(downwind.wind_mps > 0.0);

        let upwind = WindEstimate::from_tofs(0.06, 180.0, 170.0).unwrap();
        assert!(upwind.wind_mps < 0.0);
        assert!((upwind.sound_speed_mps - downwind.sound_speed_mps).abs() < 1e-9);
    }

    #[test]
    fn test_wind_recovers_path_model() {
        // 0.06 m at c = 343 m/s with 5 m/s along A to B
        let tof_ab = 0.06 / 348.0 * 1e6;
        let tof_ba = 0.06 / 338.0 * 1e6;
        let estimate = WindEstimate::from_tofs(0.06, tof_ab, tof_ba).unwrap();
        assert!((estimate.wind_mps - 5.0).abs() < 1e-9);
        assert!((estimate.sound_speed_mps - 343.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_positive_tof_has_no_estimate() {
        assert_eq!(WindEstimate::from_tofs(0.06, -1.0, 170.0), None);
    }
}
