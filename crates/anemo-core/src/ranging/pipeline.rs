use core::cell::Cell;

use log::{debug, info};

use super::report::{PathReport, RangingReport, WindEstimate};
use super::tof::extract;
use super::RangingError;
use crate::asic::{ChirpAsic, FirmwareImage, SampleBlock};
use crate::config::AnemometerConfig;
use crate::gpio::PinGroup;
use crate::platform::{Level, Platform};
use crate::runtime::Runtime;

/// Calibration results of both chips, in chip clock cycles per calibration
/// window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub a: u16,
    pub b: u16,
}

/// The pair of transducer chips facing each other across the measurement
/// path, sharing one trigger line.
pub struct Anemometer<'r, 'f, P: Platform> {
    rt: &'r Runtime<P>,
    config: AnemometerConfig,
    firmware: FirmwareImage<'f>,
    asic_a: ChirpAsic<'r, P>,
    asic_b: ChirpAsic<'r, P>,
    trigger: PinGroup,
    cycle: Cell<u32>,
}

impl<'r, 'f, P: Platform> Anemometer<'r, 'f, P> {
    pub fn new(
        rt: &'r Runtime<P>,
        config: &AnemometerConfig,
        firmware: FirmwareImage<'f>,
    ) -> Result<Self, RangingError> {
        let asic_a = ChirpAsic::new(rt, "A", config.asic_a.pins, config.timing)?;
        let asic_b = ChirpAsic::new(rt, "B", config.asic_b.pins, config.timing)?;
        let trigger = PinGroup::new(&[config.asic_a.pins.trigger, config.asic_b.pins.trigger])?;

        Ok(Self {
            rt,
            config: *config,
            firmware,
            asic_a,
            asic_b,
            trigger,
            cycle: Cell::new(0),
        })
    }

    pub fn asic_a(&self) -> &ChirpAsic<'r, P> {
        &self.asic_a
    }

    pub fn asic_b(&self) -> &ChirpAsic<'r, P> {
        &self.asic_b
    }

    pub fn config(&self) -> &AnemometerConfig {
        &self.config
    }

    /// Program both chips one after the other and check each comes up.
    ///
    /// A chip that fails its readiness check halts the runtime.
    pub async fn bring_up(&self) -> Result<(), RangingError> {
        let chips = [
            (&self.asic_a, self.config.asic_a.bus_address),
            (&self.asic_b, self.config.asic_b.bus_address),
        ];
        for (asic, address) in chips {
            asic.program(&self.firmware, address).await?;
            asic.wait_and_check_ready().await?;
        }
        info!("both chips programmed and ready");
        Ok(())
    }

    /// Calibrate both chips against one pulse on the shared trigger line,
    /// then apply the configured maximum range.
    pub async fn calibrate(&self) -> Result<Calibration, RangingError> {
        self.trigger.drive_low(self.rt)?;
        self.asic_a.prime_calibration().await?;
        self.asic_b.prime_calibration().await?;

        self.trigger.set(self.rt, Level::High)?;
        let window = self.rt.sleep(self.config.timing.calibration_window()).await;
        self.trigger.set(self.rt, Level::Low)?;
        window?;

        let calibration = Calibration {
            a: self.asic_a.read_calibration().await?,
            b: self.asic_b.read_calibration().await?,
        };

        let max_range = self.config.ranging.max_range;
        self.asic_a.set_maxrange(max_range).await?;
        self.asic_b.set_maxrange(max_range).await?;
        Ok(calibration)
    }

    /// Bring the chips up and calibrate them.
    pub async fn start(&self) -> Result<Calibration, RangingError> {
        self.bring_up().await?;
        self.calibrate().await
    }

    /// One pitch/catch cycle: A transmits to B, then B to A.
    pub async fn range_once(&self) -> Result<RangingReport, RangingError> {
        let gate = self.config.ranging.gate;
        let a_to_b = self.asic_a.sample(&self.asic_b, &self.trigger, gate).await?;
        let b_to_a = self.asic_b.sample(&self.asic_a, &self.trigger, gate).await?;

        let a_to_b = self.path_report(a_to_b, &self.asic_b)?;
        let b_to_a = self.path_report(b_to_a, &self.asic_a)?;
        let wind = self
            .config
            .ranging
            .path_length_m()
            .and_then(|length| WindEstimate::from_tofs(length, a_to_b.tof.tof_us, b_to_a.tof.tof_us));

        let cycle = self.cycle.get();
        self.cycle.set(cycle.wrapping_add(1));
        debug!(
            "cycle {}: A->B {:.3} us, B->A {:.3} us",
            cycle, a_to_b.tof.tof_us, b_to_a.tof.tof_us
        );

        Ok(RangingReport {
            cycle,
            timestamp_us: self.rt.platform().now_us(),
            a_to_b,
            b_to_a,
            wind,
        })
    }

    fn path_report(&self, block: SampleBlock, receiver: &ChirpAsic<'r, P>) -> Result<PathReport, RangingError> {
        let calibration = receiver.calibration().ok_or(RangingError::NotCalibrated)?;
        let tof = extract(
            &block,
            calibration,
            self.config.ranging.calibration_pulse_length,
        )?;
        Ok(PathReport {
            tof,
            calibration,
            block,
        })
    }

    /// Range every cycle period, handing each report to `sink`. Stops after
    /// `cycles` reports, or never when `None`. The first error ends the run.
    pub async fn run<F>(&self, cycles: Option<u32>, mut sink: F) -> Result<(), RangingError>
    where
        F: FnMut(&RangingReport),
    {
        let mut ticker = self.rt.every(self.config.ranging.cycle_period())?;
        let mut completed: u32 = 0;

        loop {
            let report = self.range_once().await?;
            sink(&report);
            completed = completed.saturating_add(1);

            if cycles.is_some_and(|limit| completed >= limit) {
                return Ok(());
            }
            if ticker.next().await.is_none() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::registers::TOF_SF;
    use crate::asic::sample::BLOCK_LEN;
    use crate::asic::{OpMode, Stage};
    use crate::bus::BusAddress;
    use crate::config::AcquisitionGate;
    use crate::platform::mock::{AcousticPath, MockPlatform, test_firmware};
    use crate::platform::BusOp;
    use crate::runtime::TaskQueue;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    fn board(config: &AnemometerConfig, wind_mps: f64) -> MockPlatform {
        let path = AcousticPath {
            wind_mps,
            ..AcousticPath::default()
        };
        MockPlatform::anemometer(config, &test_firmware(), path)
    }

    fn path_config() -> AnemometerConfig {
        let mut config = AnemometerConfig::default();
        config.ranging.path_length_mm = Some(60);
        config
    }

    #[test]
    fn test_gang_calibration() {
        let config = AnemometerConfig::default();
        let rt = Runtime::new(board(&config, 0.0));
        let firmware = test_firmware();
        let anemometer = Anemometer::new(&rt, &config, FirmwareImage::new(&firmware).unwrap()).unwrap();
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            *result.borrow_mut() = Some(anemometer.start().await);
        });
        assert!(rt.run_until(&tasks, 2000, || result.borrow().is_some()));

        let calibration = result.borrow_mut().take().unwrap().unwrap();
        // 160 ms against 301.25 kHz and 298.5 kHz oscillators
        assert_eq!(calibration, Calibration { a: 48_200, b: 47_760 });
        assert_eq!(anemometer.asic_a().stage(), Stage::Calibrated);
        assert_eq!(anemometer.asic_b().stage(), Stage::Calibrated);
        assert_eq!(anemometer.asic_a().address(), 0x30);
        assert_eq!(anemometer.asic_b().address(), 0x40);
        assert_eq!(rt.platform().chip_address(0), Some(0x30));
        assert_eq!(rt.platform().chip_address(1), Some(0x40));
    }

    #[test]
    fn test_range_once_reads_b_before_a() {
        let config = path_config();
        let rt = Runtime::new(board(&config, 0.0));
        let firmware = test_firmware();
        let anemometer = Anemometer::new(&rt, &config, FirmwareImage::new(&firmware).unwrap()).unwrap();
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            let outcome = async {
                anemometer.start().await?;
                anemometer.range_once().await
            }
            .await;
            *result.borrow_mut() = Some(outcome);
        });
        assert!(rt.run_until(&tasks, 2000, || result.borrow().is_some()));
        let report = result.borrow_mut().take().unwrap().unwrap();

        let block_reads: Vec<BusAddress> = rt
            .platform()
            .bus_log()
            .iter()
            .filter(|r| r.op == BusOp::Read && r.data.len() == BLOCK_LEN)
            .map(|r| r.address)
            .collect();
        assert_eq!(
            block_reads,
            [BusAddress::External(0x40), BusAddress::External(0x30)]
        );
        // Each block read selects TOF_SF first
        assert!(rt
            .platform()
            .bus_log()
            .iter()
            .any(|r| r.op == BusOp::Write && r.data == [TOF_SF]));

        let expected = AcousticPath::default().tof_us(true);
        assert!((report.a_to_b.tof.tof_us - expected).abs() < 0.5);
        assert!((report.b_to_a.tof.tof_us - expected).abs() < 0.5);
        assert_eq!(report.a_to_b.calibration, 47_760);
        assert_eq!(report.b_to_a.calibration, 48_200);
        assert_eq!(anemometer.asic_a().stage(), Stage::Ready);
        // B transmitted last, so A is left listening
        assert_eq!(rt.platform().chip_opmode(0), Some(OpMode::Rx));
        assert_eq!(rt.platform().chip_opmode(1), Some(OpMode::TxRx));
        assert!(!rt.bus_lock().is_held());
    }

    #[test]
    fn test_wind_separates_directions() {
        let config = path_config();
        let rt = Runtime::new(board(&config, 5.0));
        let firmware = test_firmware();
        let anemometer = Anemometer::new(&rt, &config, FirmwareImage::new(&firmware).unwrap()).unwrap();
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            let outcome = async {
                anemometer.start().await?;
                anemometer.range_once().await
            }
            .await;
            *result.borrow_mut() = Some(outcome);
        });
        assert!(rt.run_until(&tasks, 2000, || result.borrow().is_some()));
        let report = result.borrow_mut().take().unwrap().unwrap();

        let path = AcousticPath {
            wind_mps: 5.0,
            ..AcousticPath::default()
        };
        assert!(report.a_to_b.tof.tof_us < report.b_to_a.tof.tof_us);
        assert!((report.a_to_b.tof.tof_us - path.tof_us(true)).abs() < 0.5);
        assert!((report.b_to_a.tof.tof_us - path.tof_us(false)).abs() < 0.5);

        let wind = report.wind.unwrap();
        assert!((wind.wind_mps - 5.0).abs() < 0.5);
        assert!((wind.sound_speed_mps - 343.0).abs() < 1.0);
    }

    #[test]
    fn test_wind_change_between_cycles() {
        let config = path_config();
        let rt = Runtime::new(board(&config, 0.0));
        let firmware = test_firmware();
        let anemometer = Anemometer::new(&rt, &config, FirmwareImage::new(&firmware).unwrap()).unwrap();
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            let outcome = async {
                anemometer.start().await?;
                let calm = anemometer.range_once().await?;
                rt.platform().set_wind(4.0);
                let gusty = anemometer.range_once().await?;
                Ok::<_, RangingError>((calm, gusty))
            }
            .await;
            *result.borrow_mut() = Some(outcome);
        });
        assert!(rt.run_until(&tasks, 4000, || result.borrow().is_some()));
        let (calm, gusty) = result.borrow_mut().take().unwrap().unwrap();

        assert!(calm.wind.unwrap().wind_mps.abs() < 0.5);
        assert!((gusty.wind.unwrap().wind_mps - 4.0).abs() < 0.5);
        assert_eq!(gusty.cycle, calm.cycle + 1);
    }

    #[test]
    fn test_interrupt_gate_waits_for_data_ready() {
        let mut config = AnemometerConfig::default();
        config.ranging.gate = AcquisitionGate::Interrupt;
        let rt = Runtime::new(board(&config, 0.0));
        let firmware = test_firmware();
        let anemometer = Anemometer::new(&rt, &config, FirmwareImage::new(&firmware).unwrap()).unwrap();
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            let outcome = async {
                anemometer.start().await?;
                let started = rt.platform().now_us();
                let report = anemometer.range_once().await?;
                Ok::<_, RangingError>((report, rt.platform().now_us() - started))
            }
            .await;
            *result.borrow_mut() = Some(outcome);
        });
        assert!(rt.run_until(&tasks, 2000, || result.borrow().is_some()));
        let (report, elapsed_us) = result.borrow_mut().take().unwrap().unwrap();

        assert!(report.wind.is_none());
        assert!(report.a_to_b.tof.tof_us > 0.0);
        // Two data-ready delays and the trigger pulses, not two 15 ms windows
        assert!(elapsed_us < 2 * 15_000);
        assert!(!rt.platform().irq_enabled(config.asic_a.pins.trigger));
        assert!(!rt.platform().irq_enabled(config.asic_b.pins.trigger));
    }

    #[test]
    fn test_range_before_calibration_is_rejected() {
        let config = AnemometerConfig::default();
        let rt = Runtime::new(board(&config, 0.0));
        let firmware = test_firmware();
        let anemometer = Anemometer::new(&rt, &config, FirmwareImage::new(&firmware).unwrap()).unwrap();
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            let outcome = async {
                anemometer.bring_up().await?;
                anemometer.range_once().await
            }
            .await;
            *result.borrow_mut() = Some(outcome);
        });
        assert!(rt.run_until(&tasks, 2000, || result.borrow().is_some()));

        assert!(matches!(
            result.borrow_mut().take().unwrap(),
            Err(RangingError::Asic(crate::asic::AsicError::InvalidStage { .. }))
        ));
    }

    #[test]
    fn test_run_spaces_cycles_by_period() {
        let config = path_config();
        let rt = Runtime::new(board(&config, -3.0));
        let firmware = test_firmware();
        let anemometer = Anemometer::new(&rt, &config, FirmwareImage::new(&firmware).unwrap()).unwrap();
        let reports = RefCell::new(Vec::new());
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            let outcome = async {
                anemometer.start().await?;
                anemometer
                    .run(Some(3), |report| reports.borrow_mut().push(report.clone()))
                    .await
            }
            .await;
            *result.borrow_mut() = Some(outcome);
        });
        assert!(rt.run_until(&tasks, 5000, || result.borrow().is_some()));
        assert_eq!(result.borrow_mut().take().unwrap(), Ok(()));

        let reports = reports.borrow();
        let cycles: Vec<u32> = reports.iter().map(|r| r.cycle).collect();
        assert_eq!(cycles, [0, 1, 2]);
        assert_eq!(reports[1].timestamp_us - reports[0].timestamp_us, 1_000_000);
        assert_eq!(reports[2].timestamp_us - reports[1].timestamp_us, 1_000_000);
        assert!(reports.iter().all(|r| r.wind.is_some_and(|w| w.wind_mps < 0.0)));
        // The cycle timer is released with the run
        assert_eq!(rt.platform().armed_timers(), 0);
    }
}
