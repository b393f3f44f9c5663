//! Pins, pin groups and edge waits.
//!
//! Edge interrupts reach the core as [`HwEvent::PinEdge`](crate::platform::HwEvent)
//! events. Dispatch only marks the waiter's slot and wakes it, so the code
//! reacting to an edge always runs from the task queue. Each pin has at most
//! one waiter; registering a new one supersedes the previous one.

use alloc::collections::BTreeMap;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin as StdPin;
use core::task::{Context, Poll, Waker};

use heapless::Vec;
use log::{debug, trace};
use thiserror_no_std::Error;

use crate::platform::{Edge, Level, PinId, PinMode, Platform, PlatformError, Pull};
use crate::runtime::Runtime;

/// Upper bound on pins switched together as one group.
pub const MAX_GROUP_PINS: usize = 4;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioError {
    #[error("platform error: {0}")]
    Platform(PlatformError),
    #[error("edge wait on {pin:?} was replaced by a newer one")]
    Superseded { pin: PinId },
    #[error("pin group is full")]
    GroupFull,
}

impl From<PlatformError> for GpioError {
    fn from(error: PlatformError) -> Self {
        GpioError::Platform(error)
    }
}

impl embedded_hal::digital::Error for GpioError {
    fn kind(&self) -> embedded_hal::digital::ErrorKind {
        embedded_hal::digital::ErrorKind::Other
    }
}

// -----------------------------------------------------------------------------
// Interrupt table
// -----------------------------------------------------------------------------

struct IrqSlot {
    generation: u32,
    fired: bool,
    waker: Option<Waker>,
}

pub(crate) struct IrqTable {
    slots: RefCell<BTreeMap<PinId, IrqSlot>>,
    next_generation: Cell<u32>,
}

impl IrqTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: RefCell::new(BTreeMap::new()),
            next_generation: Cell::new(0),
        }
    }

    /// Install a waiter on `pin`, waking any previous one so it can observe
    /// that it was superseded.
    fn register(&self, pin: PinId) -> u32 {
        let generation = self.next_generation.get();
        self.next_generation.set(generation.wrapping_add(1));

        let previous = self.slots.borrow_mut().insert(
            pin,
            IrqSlot {
                generation,
                fired: false,
                waker: None,
            },
        );
        if let Some(waker) = previous.and_then(|slot| slot.waker) {
            debug!("edge waiter on {:?} superseded", pin);
            waker.wake();
        }
        generation
    }

    /// Record an edge. Returns `false` if nobody waits on `pin`.
    pub(crate) fn dispatch(&self, pin: PinId) -> bool {
        let waker = {
            let mut slots = self.slots.borrow_mut();
            let Some(slot) = slots.get_mut(&pin) else {
                return false;
            };
            slot.fired = true;
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    fn poll_edge(&self, pin: PinId, generation: u32, cx: &mut Context<'_>) -> Poll<Result<(), GpioError>> {
        let mut slots = self.slots.borrow_mut();
        let fired = match slots.get_mut(&pin) {
            Some(slot) if slot.generation == generation => {
                if !slot.fired {
                    slot.waker = Some(cx.waker().clone());
                }
                slot.fired
            }
            _ => return Poll::Ready(Err(GpioError::Superseded { pin })),
        };
        if fired {
            slots.remove(&pin);
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }

    /// Remove the waiter if it is still the current one for `pin`.
    fn remove_current(&self, pin: PinId, generation: u32) -> bool {
        let mut slots = self.slots.borrow_mut();
        let current = slots.get(&pin).is_some_and(|slot| slot.generation == generation);
        if current {
            slots.remove(&pin);
        }
        current
    }
}

// -----------------------------------------------------------------------------
// Pin
// -----------------------------------------------------------------------------

/// A single board pin bound to the runtime.
pub struct Pin<'r, P> {
    rt: &'r Runtime<P>,
    id: PinId,
}

impl<P: Platform> Runtime<P> {
    pub fn pin(&self, id: PinId) -> Pin<'_, P> {
        Pin { rt: self, id }
    }
}

impl<'r, P: Platform> Pin<'r, P> {
    pub fn id(&self) -> PinId {
        self.id
    }

    pub fn set_mode(&self, mode: PinMode) -> Result<(), GpioError> {
        Ok(self.rt.platform.pin_configure(self.id, mode)?)
    }

    pub fn set_level(&self, level: Level) -> Result<(), GpioError> {
        Ok(self.rt.platform.pin_set(self.id, level)?)
    }

    pub fn level(&self) -> Result<Level, GpioError> {
        Ok(self.rt.platform.pin_get(self.id)?)
    }

    pub fn set_pull(&self, pull: Pull) -> Result<(), GpioError> {
        Ok(self.rt.platform.pin_set_pull(self.id, pull)?)
    }

    /// Configure as an output driving `level`.
    pub fn drive(&self, level: Level) -> Result<(), GpioError> {
        self.set_mode(PinMode::Output)?;
        self.set_level(level)
    }

    /// Enable the edge interrupt and return a future for the next matching
    /// edge. Any earlier waiter on this pin resolves with
    /// [`GpioError::Superseded`].
    pub fn wait_for_edge(&self, edge: Edge) -> Result<EdgeWait<'r, P>, GpioError> {
        self.rt.platform.pin_enable_irq(self.id, edge)?;
        let generation = self.rt.irqs.register(self.id);
        trace!("waiting for {:?} edge on {:?}", edge, self.id);
        Ok(EdgeWait {
            rt: self.rt,
            pin: self.id,
            generation,
            done: false,
        })
    }
}

/// Future for one edge on a pin. The interrupt is disabled again once the
/// edge is seen or the wait is dropped.
#[must_use = "futures do nothing unless polled"]
pub struct EdgeWait<'r, P: Platform> {
    rt: &'r Runtime<P>,
    pin: PinId,
    generation: u32,
    done: bool,
}

impl<P: Platform> Future for EdgeWait<'_, P> {
    type Output = Result<(), GpioError>;

    fn poll(mut self: StdPin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let result = this.rt.irqs.poll_edge(this.pin, this.generation, cx);
        if let Poll::Ready(outcome) = &result {
            this.done = true;
            if outcome.is_ok() {
                this.rt.platform.pin_disable_irq(this.pin);
            }
        }
        result
    }
}

impl<P: Platform> Drop for EdgeWait<'_, P> {
    fn drop(&mut self) {
        if !self.done && self.rt.irqs.remove_current(self.pin, self.generation) {
            self.rt.platform.pin_disable_irq(self.pin);
        }
    }
}

impl<P: Platform> embedded_hal::digital::ErrorType for Pin<'_, P> {
    type Error = GpioError;
}

impl<P: Platform> embedded_hal::digital::OutputPin for Pin<'_, P> {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set_level(Level::Low)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set_level(Level::High)
    }
}

impl<P: Platform> embedded_hal::digital::InputPin for Pin<'_, P> {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.level()?.is_high())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.level()?.is_high())
    }
}

impl<P: Platform> embedded_hal_async::digital::Wait for Pin<'_, P> {
    async fn wait_for_high(&mut self) -> Result<(), Self::Error> {
        if self.level()?.is_high() {
            return Ok(());
        }
        self.wait_for_edge(Edge::Rising)?.await
    }

    async fn wait_for_low(&mut self) -> Result<(), Self::Error> {
        if !self.level()?.is_high() {
            return Ok(());
        }
        self.wait_for_edge(Edge::Falling)?.await
    }

    async fn wait_for_rising_edge(&mut self) -> Result<(), Self::Error> {
        self.wait_for_edge(Edge::Rising)?.await
    }

    async fn wait_for_falling_edge(&mut self) -> Result<(), Self::Error> {
        self.wait_for_edge(Edge::Falling)?.await
    }

    async fn wait_for_any_edge(&mut self) -> Result<(), Self::Error> {
        self.wait_for_edge(Edge::Both)?.await
    }
}

// -----------------------------------------------------------------------------
// Pin group
// -----------------------------------------------------------------------------

/// Pins that must switch as one transition, such as the trigger line shared
/// by both transducer chips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinGroup {
    pins: Vec<PinId, MAX_GROUP_PINS>,
}

impl PinGroup {
    pub fn new(pins: &[PinId]) -> Result<Self, GpioError> {
        let pins = Vec::from_slice(pins).map_err(|_| GpioError::GroupFull)?;
        Ok(Self { pins })
    }

    pub fn pins(&self) -> &[PinId] {
        &self.pins
    }

    /// Configure every pin as an output and drive it low.
    pub fn drive_low<P: Platform>(&self, rt: &Runtime<P>) -> Result<(), GpioError> {
        for &pin in &self.pins {
            rt.platform.pin_configure(pin, PinMode::Output)?;
        }
        self.set(rt, Level::Low)
    }

    pub fn set<P: Platform>(&self, rt: &Runtime<P>, level: Level) -> Result<(), GpioError> {
        Ok(rt.platform.pin_set_group(&self.pins, level)?)
    }

    /// Raise the group for `width_us` with a busy wait, then lower it.
    pub fn pulse<P: Platform>(&self, rt: &Runtime<P>, width_us: u32) -> Result<(), GpioError> {
        self.set(rt, Level::High)?;
        rt.platform.delay_us(width_us);
        self.set(rt, Level::Low)
    }
}
