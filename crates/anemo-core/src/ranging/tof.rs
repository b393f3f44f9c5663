//! Time-of-flight extraction from a received waveform block.
//!
//! The echo envelope rises across a few samples. The arrival is taken where
//! the magnitude crosses half of its peak (a quarter of the peak in squared
//! terms), interpolated linearly between the two samples that straddle it.
//! The chip's sample clock comes from the scale factor in the block and the
//! receiver's calibration against a trigger pulse of known length.

use libm::sqrt;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::asic::SampleBlock;
use crate::asic::sample::SAMPLE_COUNT;

/// Samples spent in the transmit path before the burst leaves the chip.
pub const TX_OFFSET_SAMPLES: f64 = -4.0;
/// Chip clock cycles per IQ sample.
pub const CYCLES_PER_SAMPLE: f64 = 8.0;
/// Scale factor of a chip running at its nominal rate.
pub const UNITY_SCALE_FACTOR: f64 = 2048.0;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TofError {
    #[error("waveform carries no signal")]
    NoSignal,
    #[error("scale factor, calibration or pulse length is zero")]
    ZeroFrequency,
}

/// Threshold crossing within the 16 samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    /// Last sample below the threshold before it is reached.
    pub start_index: usize,
    /// First sample at or above the threshold.
    pub end_index: usize,
    /// Interpolated, fractional sample index of the crossing.
    pub index: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TofMeasurement {
    pub start_index: u8,
    pub end_index: u8,
    pub crossing: f64,
    /// Receiver sample clock in kHz.
    pub frequency_khz: f64,
    pub tof_us: f64,
}

pub fn find_crossing(magnitudes: &[u64; SAMPLE_COUNT]) -> Result<Crossing, TofError> {
    let peak = magnitudes.iter().copied().max().unwrap_or(0);
    if peak == 0 {
        return Err(TofError::NoSignal);
    }
    let threshold = peak >> 2;

    let mut start_index = 0;
    let mut end_index = 0;
    for (n, &magnitude) in magnitudes.iter().enumerate() {
        if magnitude < threshold {
            start_index = n;
        } else {
            end_index = n;
            break;
        }
    }

    let low = sqrt(magnitudes[start_index] as f64);
    let high = sqrt(magnitudes[end_index] as f64);
    let index = if end_index == start_index || high == low {
        end_index as f64
    } else {
        start_index as f64 + (sqrt(threshold as f64) - low) / (high - low)
    };

    Ok(Crossing {
        start_index,
        end_index,
        index,
    })
}

/// Extract the time of flight from `block`, using the receiving chip's
/// `calibration` measured against a pulse of `pulse_length` units.
pub fn extract(block: &SampleBlock, calibration: u16, pulse_length: u32) -> Result<TofMeasurement, TofError> {
    if block.scale_factor == 0 || calibration == 0 || pulse_length == 0 {
        return Err(TofError::ZeroFrequency);
    }

    let crossing = find_crossing(&block.magnitudes_squared())?;
    let frequency_khz =
        block.scale_factor as f64 / UNITY_SCALE_FACTOR * calibration as f64 / pulse_length as f64;
    let tof_ms = (crossing.index + TX_OFFSET_SAMPLES) / frequency_khz * CYCLES_PER_SAMPLE;

    Ok(TofMeasurement {
        start_index: crossing.start_index as u8,
        end_index: crossing.end_index as u8,
        crossing: crossing.index,
        frequency_khz,
        tof_us: tof_ms * 1000.0,
    })
}
