//! Watchdog supervision.
//!
//! The board's external watchdog resets it unless kicked every period. The
//! kicker runs as an ordinary task, so a wedged task queue or a halted
//! runtime both starve it.

use embassy_time::Duration;
use log::{info, warn};

use crate::platform::{Platform, PlatformError};
use crate::runtime::Runtime;

/// Kick the watchdog every `period` until the runtime halts.
pub async fn kick_watchdog<P: Platform>(rt: &Runtime<P>, period: Duration) -> Result<(), PlatformError> {
    let mut ticker = rt.every(period)?;
    info!("watchdog kicker started ({} ms)", period.as_millis());

    loop {
        if let Some(reason) = rt.halt_reason() {
            warn!("not kicking watchdog: {:?}", reason);
            return Ok(());
        }
        rt.platform().kick_watchdog();
        if ticker.next().await.is_none() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::{AsicError, FirmwareImage};
    use crate::config::AnemometerConfig;
    use crate::platform::mock::{CHIP_A_CLOCK_KHZ, CHIP_B_CLOCK_KHZ, MockPlatform, SimChip, test_firmware};
    use crate::ranging::{Anemometer, RangingError};
    use crate::runtime::{HaltReason, TaskQueue};
    use core::cell::RefCell;

    #[test]
    fn test_kicks_every_period() {
        let rt = Runtime::new(MockPlatform::new());
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            let _ = kick_watchdog(&rt, Duration::from_millis(100)).await;
        });
        rt.run_until(&tasks, 200, || rt.platform().now_us() >= 1_000_000);

        // Kicks at 0 through 900 ms; the 1 s tick is still queued
        assert_eq!(rt.platform().watchdog_kicks(), 10);
    }

    #[test]
    fn test_failed_bring_up_starves_watchdog() {
        let config = AnemometerConfig::default();
        let firmware = test_firmware();
        let platform = MockPlatform::new()
            .with_chip(SimChip::new(config.asic_a.pins, CHIP_A_CLOCK_KHZ, firmware.clone()))
            .with_chip(SimChip::new(config.asic_b.pins, CHIP_B_CLOCK_KHZ, firmware.clone()).failing_boot());
        let rt = Runtime::new(platform);
        let anemometer = Anemometer::new(&rt, &config, FirmwareImage::new(&firmware).unwrap()).unwrap();
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            let _ = kick_watchdog(&rt, Duration::from_millis(100)).await;
        });
        tasks.spawn(async {
            *result.borrow_mut() = Some(anemometer.start().await);
        });
        assert!(rt.run_until(&tasks, 2000, || rt.is_halted()));

        assert_eq!(
            result.borrow_mut().take(),
            Some(Err(RangingError::Asic(AsicError::NotReady {
                address: 0x40,
                value: 0x00
            })))
        );
        assert_eq!(
            rt.halt_reason(),
            Some(HaltReason::AsicNotReady {
                address: 0x40,
                value: 0x00
            })
        );

        let kicks = rt.platform().watchdog_kicks();
        assert!(kicks > 0);
        rt.run_until(&tasks, 100, || false);
        assert_eq!(rt.platform().watchdog_kicks(), kicks);
    }
}
