//! Waveform block read back from the receiving chip after a burst.
//!
//! Layout, little-endian: scale factor (u16), the chip's own TOF estimate
//! (u16), intensity (u16), then 16 complex samples as (Q, I) pairs of i16.

use serde::{Deserialize, Serialize};

use super::AsicError;

pub const SAMPLE_COUNT: usize = 16;
pub const BLOCK_LEN: usize = 6 + SAMPLE_COUNT * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IqSample {
    pub q: i16,
    pub i: i16,
}

impl IqSample {
    pub fn magnitude_squared(self) -> u64 {
        let q = self.q as i64;
        let i = self.i as i64;
        (q * q + i * i) as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleBlock {
    pub scale_factor: u16,
    pub chip_tof: u16,
    pub intensity: u16,
    pub samples: [IqSample; SAMPLE_COUNT],
}

fn le_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

impl SampleBlock {
    pub fn parse(raw: &[u8]) -> Result<Self, AsicError> {
        if raw.len() < BLOCK_LEN {
            return Err(AsicError::ShortRead {
                expected: BLOCK_LEN,
                actual: raw.len(),
            });
        }

        let mut samples = [IqSample::default(); SAMPLE_COUNT];
        for (n, sample) in samples.iter_mut().enumerate() {
            let at = 6 + n * 4;
            sample.q = le_u16(raw, at) as i16;
            sample.i = le_u16(raw, at + 2) as i16;
        }

        Ok(Self {
            scale_factor: le_u16(raw, 0),
            chip_tof: le_u16(raw, 2),
            intensity: le_u16(raw, 4),
            samples,
        })
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_LEN] {
        let mut raw = [0u8; BLOCK_LEN];
        raw[0..2].copy_from_slice(&self.scale_factor.to_le_bytes());
        raw[2..4].copy_from_slice(&self.chip_tof.to_le_bytes());
        raw[4..6].copy_from_slice(&self.intensity.to_le_bytes());
        for (n, sample) in self.samples.iter().enumerate() {
            let at = 6 + n * 4;
            raw[at..at + 2].copy_from_slice(&sample.q.to_le_bytes());
            raw[at + 2..at + 4].copy_from_slice(&sample.i.to_le_bytes());
        }
        raw
    }

    pub fn magnitudes_squared(&self) -> [u64; SAMPLE_COUNT] {
        self.samples.map(IqSample::magnitude_squared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_layout() {
        let mut raw = [0u8; BLOCK_LEN];
        raw[0] = 0x00;
        raw[1] = 0x08; // scale factor 2048
        raw[2] = 0x34;
        raw[3] = 0x12;
        raw[6] = 0xFF;
        raw[7] = 0xFF; // q[0] = -1
        raw[8] = 0x05; // i[0] = 5
        raw[6 + 15 * 4 + 2] = 0x07; // i[15] = 7

        let block = SampleBlock::parse(&raw).unwrap();
        assert_eq!(block.scale_factor, 2048);
        assert_eq!(block.chip_tof, 0x1234);
        assert_eq!(block.samples[0], IqSample { q: -1, i: 5 });
        assert_eq!(block.samples[15], IqSample { q: 0, i: 7 });
        assert_eq!(block.magnitudes_squared()[0], 26);
        assert_eq!(block.to_bytes(), raw);
    }

    #[test]
    fn test_short_block_rejected() {
        assert_eq!(
            SampleBlock::parse(&[0u8; 10]),
            Err(AsicError::ShortRead {
                expected: BLOCK_LEN,
                actual: 10
            })
        );
    }

    #[test]
    fn test_extreme_magnitude_does_not_overflow() {
        let sample = IqSample { q: i16::MIN, i: i16::MIN };
        assert_eq!(sample.magnitude_squared(), 2 * 32768 * 32768);
    }
}
