//! Two-chip pitch/catch ranging.
//!
//! Each cycle fires chip A into chip B, then B into A, and converts both
//! received waveforms into times of flight using the receiving chip's
//! calibration. With a known path length the pair also yields a wind and
//! sound-speed estimate.

mod pipeline;
mod report;
pub mod tof;

use thiserror_no_std::Error;

pub use pipeline::{Anemometer, Calibration};
pub use report::{PathReport, RangingReport, WindEstimate};
pub use tof::{TofError, TofMeasurement, extract};

use crate::asic::AsicError;
use crate::gpio::GpioError;
use crate::platform::PlatformError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangingError {
    #[error("chip error: {0}")]
    Asic(AsicError),
    #[error("time-of-flight error: {0}")]
    Tof(TofError),
    #[error("gpio error: {0}")]
    Gpio(GpioError),
    #[error("platform error: {0}")]
    Platform(PlatformError),
    #[error("ranging before calibration")]
    NotCalibrated,
}

impl From<AsicError> for RangingError {
    fn from(error: AsicError) -> Self {
        RangingError::Asic(error)
    }
}

impl From<TofError> for RangingError {
    fn from(error: TofError) -> Self {
        RangingError::Tof(error)
    }
}

impl From<GpioError> for RangingError {
    fn from(error: GpioError) -> Self {
        RangingError::Gpio(error)
    }
}

impl From<PlatformError> for RangingError {
    fn from(error: PlatformError) -> Self {
        RangingError::Platform(error)
    }
}
