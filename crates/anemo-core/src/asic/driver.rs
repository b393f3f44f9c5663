use alloc::vec;
use core::cell::Cell;

use log::{debug, error, info, warn};

use super::registers::*;
use super::sample::{BLOCK_LEN, SampleBlock};
use super::{AsicError, FirmwareImage, OpMode, Stage};
use crate::bus::{BusAddress, BusFlags};
use crate::config::{AcquisitionGate, AsicPins, AsicTiming};
use crate::gpio::PinGroup;
use crate::platform::{Edge, Level, PinMode, Platform};
use crate::runtime::{HaltReason, Runtime};

/// Diagnostic snapshot of a chip's runtime registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsicState {
    pub ready: u8,
    pub tick_interval: u16,
    pub opmode: Option<OpMode>,
    pub max_range: u8,
}

/// One transducer chip on the external bus.
pub struct ChirpAsic<'r, P: Platform> {
    rt: &'r Runtime<P>,
    name: &'static str,
    pins: AsicPins,
    timing: AsicTiming,
    address: Cell<u8>,
    stage: Cell<Stage>,
    calibration: Cell<Option<u16>>,
}

impl<'r, P: Platform> ChirpAsic<'r, P> {
    /// Bind a chip to its pins and park them idle: reset and program low,
    /// trigger line as input.
    pub fn new(
        rt: &'r Runtime<P>,
        name: &'static str,
        pins: AsicPins,
        timing: AsicTiming,
    ) -> Result<Self, AsicError> {
        rt.pin(pins.reset).drive(Level::Low)?;
        rt.pin(pins.program).drive(Level::Low)?;
        rt.pin(pins.trigger).set_mode(PinMode::Input)?;

        Ok(Self {
            rt,
            name,
            pins,
            timing,
            address: Cell::new(FACTORY_ADDRESS),
            stage: Cell::new(Stage::Unprogrammed),
            calibration: Cell::new(None),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current bus address, 8-bit form.
    pub fn address(&self) -> u8 {
        self.address.get()
    }

    pub fn bus_address(&self) -> BusAddress {
        BusAddress::External(self.address.get())
    }

    pub fn stage(&self) -> Stage {
        self.stage.get()
    }

    /// Result of the last calibration, in chip clock cycles per calibration
    /// window.
    pub fn calibration(&self) -> Option<u16> {
        self.calibration.get()
    }

    pub fn pins(&self) -> AsicPins {
        self.pins
    }

    fn expect_stage(&self, allowed: &[Stage], expected: Stage) -> Result<(), AsicError> {
        let actual = self.stage.get();
        if actual == Stage::Faulted {
            return Err(AsicError::Faulted);
        }
        if allowed.contains(&actual) {
            Ok(())
        } else {
            Err(AsicError::InvalidStage { expected, actual })
        }
    }

    fn expect_running(&self) -> Result<(), AsicError> {
        self.expect_stage(
            &[
                Stage::Ready,
                Stage::Calibrating,
                Stage::Calibrated,
                Stage::Sampling,
            ],
            Stage::Ready,
        )
    }

    fn expect_calibrated(&self) -> Result<(), AsicError> {
        self.expect_stage(&[Stage::Ready, Stage::Calibrated], Stage::Calibrated)?;
        match self.calibration.get() {
            Some(_) => Ok(()),
            None => Err(AsicError::InvalidStage {
                expected: Stage::Calibrated,
                actual: self.stage.get(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Programming
    // -------------------------------------------------------------------------

    /// Upload `firmware`, assign the runtime bus address `target` and start
    /// the chip CPU. The first failing step aborts the sequence.
    pub async fn program(&self, firmware: &FirmwareImage<'_>, target: u8) -> Result<(), AsicError> {
        self.expect_stage(
            &[Stage::Unprogrammed, Stage::Ready, Stage::Calibrated],
            Stage::Unprogrammed,
        )?;
        info!("{}: programming, target address {:#04x}", self.name, target);
        self.stage.set(Stage::Programming);
        self.calibration.set(None);

        match self.upload(firmware, target).await {
            Ok(()) => {
                self.address.set(target);
                self.stage.set(Stage::Ready);
                info!("{}: firmware running at {:#04x}", self.name, target);
                Ok(())
            }
            Err(e) => {
                error!("{}: programming failed: {}", self.name, e);
                if let Err(pin_error) = self.rt.pin(self.pins.program).set_level(Level::Low) {
                    warn!("{}: could not leave program mode: {}", self.name, pin_error);
                }
                self.address.set(FACTORY_ADDRESS);
                self.stage.set(Stage::Unprogrammed);
                Err(e)
            }
        }
    }

    async fn upload(&self, firmware: &FirmwareImage<'_>, target: u8) -> Result<(), AsicError> {
        let reset = self.rt.pin(self.pins.reset);
        let program = self.rt.pin(self.pins.program);

        // Releasing reset while program is held enters program mode
        reset.drive(Level::Low)?;
        self.rt.sleep(self.timing.reset_hold()).await?;
        program.drive(Level::High)?;
        self.rt.sleep(self.timing.program_entry()).await?;
        reset.set_level(Level::High)?;
        self.rt.sleep(self.timing.program_settle()).await?;

        let guard = self.rt.bus_lock().acquire().await;
        let start = BusFlags::START | BusFlags::STOP;

        let load = FIRMWARE_LOAD_ADDRESS.to_le_bytes();
        self.program_write(start, &[PROG_ADDR, load[0], load[1]]).await?;
        let count = firmware.transfer_count().to_le_bytes();
        self.program_write(start, &[PROG_CNT, count[0], count[1]]).await?;
        // Left open: the image streams as the body of this transfer
        self.program_write(BusFlags::START, &[PROG_CTL, PROG_CTL_EXECUTE])
            .await?;

        for page in firmware.pages() {
            let flags = if page.last {
                BusFlags::STOP
            } else {
                BusFlags::NONE
            };
            if let Err(e) = self.program_write(flags, page.data).await {
                error!("{}: firmware page at {:#06x} failed: {}", self.name, page.offset, e);
                return Err(e);
            }
        }
        debug!("{}: {} bytes uploaded", self.name, firmware.as_bytes().len());

        let location = BUS_ADDRESS_LOCATION.to_le_bytes();
        self.program_write(start, &[PROG_ADDR, location[0], location[1]])
            .await?;
        self.program_write(start, &[PROG_DATA, target >> 1]).await?;
        self.program_write(start, &[PROG_CTL, PROG_CTL_EXECUTE]).await?;
        self.program_write(start, &[PROG_CPU, PROG_CPU_RUN]).await?;

        program.set_level(Level::Low)?;
        guard.release();
        Ok(())
    }

    async fn program_write(&self, flags: BusFlags, bytes: &[u8]) -> Result<(), AsicError> {
        self.rt
            .write(BusAddress::External(FACTORY_ADDRESS), flags, bytes.to_vec())
            .await
            .into_result()?;
        Ok(())
    }

    /// Let the firmware boot, then confirm it reports ready. Any other value
    /// faults the chip and halts the runtime.
    pub async fn wait_and_check_ready(&self) -> Result<(), AsicError> {
        self.expect_stage(&[Stage::Ready], Stage::Ready)?;
        self.rt.sleep(self.timing.ready_settle()).await?;

        let value = self.read_u8(READY).await?;
        if value != READY_VALUE {
            let address = self.address();
            error!(
                "{}: READY at {:#04x} reads {:#04x}, expected {:#04x}",
                self.name, address, value, READY_VALUE
            );
            self.stage.set(Stage::Faulted);
            self.rt.halt(HaltReason::AsicNotReady { address, value });
            return Err(AsicError::NotReady { address, value });
        }

        info!("{}: ready", self.name);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Registers
    // -------------------------------------------------------------------------

    async fn read_u8(&self, register: u8) -> Result<u8, AsicError> {
        let raw = self.rt.read_register(self.bus_address(), register, 1).await?;
        raw.first().copied().ok_or(AsicError::ShortRead {
            expected: 1,
            actual: 0,
        })
    }

    async fn read_u16(&self, register: u8) -> Result<u16, AsicError> {
        let raw = self.rt.read_register(self.bus_address(), register, 2).await?;
        match raw.as_slice() {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            _ => Err(AsicError::ShortRead {
                expected: 2,
                actual: raw.len(),
            }),
        }
    }

    /// Write `data` using the chip's `[register, size, data...]` framing.
    async fn write_chip_register(&self, register: u8, data: &[u8]) -> Result<(), AsicError> {
        let mut contents = vec![data.len() as u8];
        contents.extend_from_slice(data);
        self.rt
            .write_register(self.bus_address(), register, &contents)
            .await?;
        Ok(())
    }

    pub async fn set_opmode(&self, mode: OpMode) -> Result<(), AsicError> {
        self.expect_running()?;
        debug!("{}: opmode {:?}", self.name, mode);
        self.write_chip_register(OPMODE, &[mode as u8]).await
    }

    pub async fn set_maxrange(&self, range: u8) -> Result<(), AsicError> {
        self.expect_running()?;
        self.write_chip_register(MAX_RANGE, &[range]).await
    }

    /// Read the diagnostic registers under one bus lock hold.
    pub async fn read_state(&self) -> Result<AsicState, AsicError> {
        self.expect_running()?;
        let address = self.bus_address();
        let guard = self.rt.bus_lock().acquire().await;

        let ready = self.rt.read_register_locked(&guard, address, READY, 1).await?;
        let tick = self
            .rt
            .read_register_locked(&guard, address, TICK_INTERVAL, 2)
            .await?;
        let opmode = self.rt.read_register_locked(&guard, address, OPMODE, 1).await?;
        let max_range = self
            .rt
            .read_register_locked(&guard, address, MAX_RANGE, 1)
            .await?;
        guard.release();

        match (ready.as_slice(), tick.as_slice(), opmode.as_slice(), max_range.as_slice()) {
            ([ready], [lo, hi], [opmode], [max_range]) => Ok(AsicState {
                ready: *ready,
                tick_interval: u16::from_le_bytes([*lo, *hi]),
                opmode: OpMode::from_raw(*opmode),
                max_range: *max_range,
            }),
            _ => Err(AsicError::ShortRead {
                expected: 5,
                actual: ready.len() + tick.len() + opmode.len() + max_range.len(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Calibration
    // -------------------------------------------------------------------------

    /// Arm the chip to measure the next trigger pulse.
    pub async fn prime_calibration(&self) -> Result<(), AsicError> {
        self.expect_stage(&[Stage::Ready, Stage::Calibrated], Stage::Ready)?;
        self.write_chip_register(CAL_TRIG, &[1]).await?;
        self.stage.set(Stage::Calibrating);
        Ok(())
    }

    /// Collect the measured pulse length after the calibration pulse.
    pub async fn read_calibration(&self) -> Result<u16, AsicError> {
        self.expect_stage(&[Stage::Calibrating], Stage::Calibrating)?;
        let result = self.read_u16(CAL_RESULT).await?;
        self.calibration.set(Some(result));
        self.stage.set(Stage::Calibrated);
        info!("{}: calibration result {}", self.name, result);
        Ok(result)
    }

    /// Calibrate this chip alone with its own trigger line.
    pub async fn calibrate(&self) -> Result<u16, AsicError> {
        let trigger = self.rt.pin(self.pins.trigger);
        trigger.drive(Level::Low)?;
        self.prime_calibration().await?;

        trigger.set_level(Level::High)?;
        let window = self.rt.sleep(self.timing.calibration_window()).await;
        trigger.set_level(Level::Low)?;
        window?;

        self.read_calibration().await
    }

    // -------------------------------------------------------------------------
    // Sampling
    // -------------------------------------------------------------------------

    /// Wait for the data-ready edge on this chip's trigger line.
    pub async fn wait_for_data_ready(&self) -> Result<(), AsicError> {
        let line = self.rt.pin(self.pins.trigger);
        line.set_mode(PinMode::Input)?;
        line.wait_for_edge(Edge::Rising)?.await?;
        Ok(())
    }

    /// Transmit from this chip and capture the waveform at `receiver`.
    ///
    /// This chip goes to TX+RX mode and the receiver to RX-only, then both
    /// are fired by one pulse on the shared `trigger` group.
    pub async fn sample(
        &self,
        receiver: &ChirpAsic<'r, P>,
        trigger: &PinGroup,
        gate: AcquisitionGate,
    ) -> Result<SampleBlock, AsicError> {
        self.expect_calibrated()?;
        receiver.expect_calibrated()?;
        self.stage.set(Stage::Sampling);
        receiver.stage.set(Stage::Sampling);

        let result = self.pitch_catch(receiver, trigger, gate).await;

        self.stage.set(Stage::Ready);
        receiver.stage.set(Stage::Ready);
        result
    }

    async fn pitch_catch(
        &self,
        receiver: &ChirpAsic<'r, P>,
        trigger: &PinGroup,
        gate: AcquisitionGate,
    ) -> Result<SampleBlock, AsicError> {
        trigger.drive_low(self.rt)?;
        self.set_opmode(OpMode::TxRx).await?;
        receiver.set_opmode(OpMode::Rx).await?;

        trigger.pulse(self.rt, self.timing.trigger_pulse_us)?;
        match gate {
            AcquisitionGate::Window => self.rt.sleep(self.timing.acquisition_window()).await?,
            AcquisitionGate::Interrupt => receiver.wait_for_data_ready().await?,
        }

        let raw = self
            .rt
            .read_register(receiver.bus_address(), TOF_SF, BLOCK_LEN)
            .await?;
        let block = SampleBlock::parse(&raw)?;
        debug!(
            "{} -> {}: scale {} intensity {}",
            self.name, receiver.name, block.scale_factor, block.intensity
        );
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, BusStatus};
    use crate::config::AnemometerConfig;
    use crate::platform::BusOp;
    use crate::platform::mock::{BusFault, MockPlatform, SimChip, test_firmware};
    use crate::runtime::TaskQueue;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    fn single_chip(firmware: &[u8]) -> (MockPlatform, AnemometerConfig) {
        let config = AnemometerConfig::default();
        let platform = MockPlatform::new().with_chip(SimChip::new(
            config.asic_a.pins,
            301.25,
            firmware.to_vec(),
        ));
        (platform, config)
    }

    #[test]
    fn test_program_then_ready() {
        let firmware = test_firmware();
        let (platform, config) = single_chip(&firmware);
        let rt = Runtime::new(platform);
        let image = FirmwareImage::new(&firmware).unwrap();
        let asic = ChirpAsic::new(&rt, "A", config.asic_a.pins, config.timing).unwrap();
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            let outcome = async {
                asic.program(&image, 0x30).await?;
                asic.wait_and_check_ready().await?;
                asic.read_state().await
            }
            .await;
            *result.borrow_mut() = Some(outcome);
        });
        assert!(rt.run_until(&tasks, 1000, || result.borrow().is_some()));

        let state = result.borrow_mut().take().unwrap().unwrap();
        assert_eq!(state.ready, READY_VALUE);
        assert_eq!(asic.address(), 0x30);
        assert_eq!(asic.stage(), Stage::Ready);
        assert!(!rt.bus_lock().is_held());
        // Three 100 ms pin steps plus the 60 ms boot wait
        assert_eq!(rt.platform().now_us(), 360_000);

        let log = rt.platform().bus_log();
        let factory: Vec<_> = log
            .iter()
            .filter(|r| r.address == BusAddress::External(FACTORY_ADDRESS))
            .collect();
        assert_eq!(factory.len(), 3 + 16 + 4);
        assert_eq!(factory[0].data, vec![PROG_ADDR, 0x00, 0xF8]);
        assert_eq!(factory[1].data, vec![PROG_CNT, 0xFF, 0x07]);
        assert_eq!(factory[2].flags, BusFlags::START);
        assert_eq!(factory[3].flags, BusFlags::NONE);
        assert_eq!(factory[18].flags, BusFlags::STOP);
        assert_eq!(factory[20].data, vec![PROG_DATA, 0x18]);
    }

    #[test]
    fn test_data_nak_on_page_aborts_upload() {
        let firmware = test_firmware();
        let (platform, config) = single_chip(&firmware);
        const FAILING_PAGE: usize = 5;
        platform.inject_fault(BusFault {
            address: BusAddress::External(FACTORY_ADDRESS),
            op: BusOp::Write,
            occurrence: 3 + FAILING_PAGE,
            status: BusStatus::DataNak,
        });
        let rt = Runtime::new(platform);
        let image = FirmwareImage::new(&firmware).unwrap();
        let asic = ChirpAsic::new(&rt, "A", config.asic_a.pins, config.timing).unwrap();
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            *result.borrow_mut() = Some(asic.program(&image, 0x30).await);
        });
        assert!(rt.run_until(&tasks, 1000, || result.borrow().is_some()));

        assert_eq!(
            result.borrow_mut().take(),
            Some(Err(AsicError::Bus(BusError::DataNak)))
        );
        let log = rt.platform().bus_log();
        // Setup writes, the good pages, then the failing page and nothing after
        assert_eq!(log.len(), 3 + FAILING_PAGE + 1);
        assert_eq!(log.last().unwrap().status, BusStatus::DataNak);
        assert_eq!(rt.platform().chip_firmware_received(0), FAILING_PAGE * 128);
        assert_eq!(asic.stage(), Stage::Unprogrammed);
        assert_eq!(asic.address(), FACTORY_ADDRESS);
        assert!(!rt.bus_lock().is_held());
        assert_eq!(rt.platform().level(config.asic_a.pins.program), Level::Low);
    }

    #[test]
    fn test_bad_ready_value_faults_and_halts() {
        let firmware = test_firmware();
        let config = AnemometerConfig::default();
        let platform = MockPlatform::new().with_chip(
            SimChip::new(config.asic_a.pins, 301.25, firmware.clone()).failing_boot(),
        );
        let rt = Runtime::new(platform);
        let image = FirmwareImage::new(&firmware).unwrap();
        let asic = ChirpAsic::new(&rt, "A", config.asic_a.pins, config.timing).unwrap();
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            let outcome = async {
                asic.program(&image, 0x30).await?;
                asic.wait_and_check_ready().await
            }
            .await;
            *result.borrow_mut() = Some(outcome);
        });
        assert!(rt.run_until(&tasks, 1000, || result.borrow().is_some()));

        assert_eq!(
            result.borrow_mut().take(),
            Some(Err(AsicError::NotReady {
                address: 0x30,
                value: 0x00
            }))
        );
        assert_eq!(asic.stage(), Stage::Faulted);
        assert!(rt.is_halted());
    }

    #[test]
    fn test_single_chip_calibration() {
        let firmware = test_firmware();
        let (platform, config) = single_chip(&firmware);
        let rt = Runtime::new(platform);
        let image = FirmwareImage::new(&firmware).unwrap();
        let asic = ChirpAsic::new(&rt, "A", config.asic_a.pins, config.timing).unwrap();
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            let outcome = async {
                asic.program(&image, 0x30).await?;
                asic.wait_and_check_ready().await?;
                asic.calibrate().await
            }
            .await;
            *result.borrow_mut() = Some(outcome);
        });
        assert!(rt.run_until(&tasks, 1000, || result.borrow().is_some()));

        // 160 ms at 301.25 kHz
        assert_eq!(result.borrow_mut().take(), Some(Ok(48_200)));
        assert_eq!(asic.calibration(), Some(48_200));
        assert_eq!(asic.stage(), Stage::Calibrated);
    }

    #[test]
    fn test_operations_before_programming_are_rejected() {
        let firmware = test_firmware();
        let (platform, config) = single_chip(&firmware);
        let rt = Runtime::new(platform);
        let asic = ChirpAsic::new(&rt, "A", config.asic_a.pins, config.timing).unwrap();
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            *result.borrow_mut() = Some(asic.set_opmode(OpMode::TxRx).await);
        });
        assert!(rt.run_until(&tasks, 100, || result.borrow().is_some()));

        assert_eq!(
            result.borrow_mut().take(),
            Some(Err(AsicError::InvalidStage {
                expected: Stage::Ready,
                actual: Stage::Unprogrammed
            }))
        );
        assert!(rt.platform().bus_log().is_empty());
    }
}
