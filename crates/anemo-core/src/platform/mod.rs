//! Board abstraction.
//!
//! Everything the core needs from the hardware goes through [`Platform`]:
//! pin control, edge interrupts, bus transaction issue, timers, the idle
//! wait and the watchdog. Completions and interrupts never call back into
//! the core directly. The platform queues them as [`HwEvent`]s and the
//! runtime drains them with [`Platform::take_event`] between scheduler
//! passes, so all handler code runs from the task queue.

use alloc::vec::Vec;
use embassy_time::Duration;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::bus::{BusAddress, BusFlags, BusStatus};

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// Physical pin identifier as numbered by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PinId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    None,
    Up,
    Down,
    /// Bus-keeper: hold the last driven level.
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Whether a transition to `level` matches this edge selection.
    pub fn matches(self, level: Level) -> bool {
        match self {
            Edge::Rising => level == Level::High,
            Edge::Falling => level == Level::Low,
            Edge::Both => true,
        }
    }
}

/// Identifies one in-flight bus transaction in the runtime's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u32);

/// Identifies one armed timer in the runtime's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusOp {
    Write,
    Read,
}

/// A bus operation handed to the platform.
///
/// For writes `buffer` holds the payload. For reads it is the target,
/// already sized to the requested length; the platform hands it back filled
/// in the matching [`HwEvent::BusComplete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRequest {
    pub address: BusAddress,
    pub flags: BusFlags,
    pub op: BusOp,
    pub buffer: Vec<u8>,
}

/// Hardware notifications queued by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwEvent {
    BusComplete {
        id: TransactionId,
        status: BusStatus,
        buffer: Vec<u8>,
    },
    TimerFired(TimerId),
    PinEdge(PinId),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformError {
    #[error("pin {0:?} does not exist on this board")]
    InvalidPin(PinId),
    #[error("pin {0:?} is not configured as an output")]
    NotOutput(PinId),
    #[error("no hardware timer available")]
    TimerUnavailable,
    #[error("operation not supported by this platform")]
    Unsupported,
}

/// Board services consumed by the runtime and drivers.
///
/// All methods take `&self`: implementations keep their state behind
/// interior mutability, since the runtime shares one platform between every
/// task it runs.
pub trait Platform {
    // ---------------------------------------------------------------------
    // Pins
    // ---------------------------------------------------------------------

    fn pin_configure(&self, pin: PinId, mode: PinMode) -> Result<(), PlatformError>;

    fn pin_set(&self, pin: PinId, level: Level) -> Result<(), PlatformError>;

    /// Drive several pins as one transition.
    ///
    /// Boards that can switch a port in one register write should override
    /// this so the pins change together.
    fn pin_set_group(&self, pins: &[PinId], level: Level) -> Result<(), PlatformError> {
        for &pin in pins {
            self.pin_set(pin, level)?;
        }
        Ok(())
    }

    fn pin_get(&self, pin: PinId) -> Result<Level, PlatformError>;

    fn pin_set_pull(&self, pin: PinId, pull: Pull) -> Result<(), PlatformError>;

    /// Enable the edge interrupt on `pin`, replacing any previous selection.
    /// Each matching edge queues a [`HwEvent::PinEdge`].
    fn pin_enable_irq(&self, pin: PinId, edge: Edge) -> Result<(), PlatformError>;

    fn pin_disable_irq(&self, pin: PinId);

    // ---------------------------------------------------------------------
    // Bus
    // ---------------------------------------------------------------------

    /// Start a bus operation. Completion arrives later as
    /// [`HwEvent::BusComplete`] carrying `id`.
    ///
    /// If the operation cannot be started the request is handed back and no
    /// completion will ever be queued for `id`.
    fn bus_issue(&self, id: TransactionId, request: BusRequest) -> Result<(), BusRequest>;

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    /// Arm a timer. Periodic timers re-arm themselves in hardware until
    /// cancelled.
    fn timer_arm(&self, id: TimerId, delay: Duration, periodic: bool) -> Result<(), PlatformError>;

    /// Best-effort cancel. A firing already queued is not withdrawn.
    fn timer_cancel(&self, id: TimerId);

    // ---------------------------------------------------------------------
    // Events, idle and housekeeping
    // ---------------------------------------------------------------------

    fn take_event(&self) -> Option<HwEvent>;

    /// Block until at least one event may be available.
    fn wait_for_event(&self);

    /// Short busy wait, for pulses too narrow for a timer.
    fn delay_us(&self, us: u32);

    /// Monotonic time since boot.
    fn now_us(&self) -> u64;

    fn kick_watchdog(&self);
}
