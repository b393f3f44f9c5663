//! Timer registry and handles.
//!
//! The registry owns one slot per armed timer, keyed by [`TimerId`]. A
//! platform firing bumps the slot's pending count and wakes the waiter; the
//! waiter consumes firings one at a time through [`Timer::next`]. One-shot
//! slots are removed once their firing is consumed, periodic slots once the
//! timer is cancelled and drained.

use alloc::collections::BTreeMap;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use embassy_time::Duration;
use log::trace;

use super::Runtime;
use crate::platform::{Platform, PlatformError, TimerId};

struct TimerSlot {
    periodic: bool,
    pending: u32,
    cancelled: bool,
    waker: Option<Waker>,
}

pub(crate) struct TimerService {
    slots: RefCell<BTreeMap<TimerId, TimerSlot>>,
    next_id: Cell<u32>,
}

impl TimerService {
    pub(crate) fn new() -> Self {
        Self {
            slots: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(0),
        }
    }

    fn register(&self, periodic: bool) -> TimerId {
        let mut slots = self.slots.borrow_mut();
        let mut id = TimerId(self.next_id.get());
        while slots.contains_key(&id) {
            id = TimerId(id.0.wrapping_add(1));
        }
        self.next_id.set(id.0.wrapping_add(1));
        slots.insert(
            id,
            TimerSlot {
                periodic,
                pending: 0,
                cancelled: false,
                waker: None,
            },
        );
        id
    }

    fn remove(&self, id: TimerId) {
        self.slots.borrow_mut().remove(&id);
    }

    /// Record a platform firing. Returns `false` if no live slot wanted it.
    pub(crate) fn fire(&self, id: TimerId) -> bool {
        let waker = {
            let mut slots = self.slots.borrow_mut();
            match slots.get_mut(&id) {
                Some(slot) if !slot.cancelled => {
                    slot.pending += 1;
                    slot.waker.take()
                }
                _ => return false,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// Mark the slot cancelled and wake its waiter so it can observe the
    /// end. Returns `true` if the platform timer still has to be stopped.
    fn mark_cancelled(&self, id: TimerId) -> bool {
        let waker = {
            let mut slots = self.slots.borrow_mut();
            match slots.get_mut(&id) {
                Some(slot) if !slot.cancelled => {
                    slot.cancelled = true;
                    slot.waker.take()
                }
                _ => return false,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    fn poll_fired(&self, id: TimerId, cx: &mut Context<'_>) -> Poll<Option<()>> {
        let mut slots = self.slots.borrow_mut();
        let Some(slot) = slots.get_mut(&id) else {
            return Poll::Ready(None);
        };

        if slot.pending > 0 {
            slot.pending -= 1;
            if !slot.periodic || (slot.cancelled && slot.pending == 0) {
                slots.remove(&id);
            }
            return Poll::Ready(Some(()));
        }

        if slot.cancelled {
            slots.remove(&id);
            return Poll::Ready(None);
        }

        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    #[cfg(test)]
    pub(crate) fn is_live(&self, id: TimerId) -> bool {
        self.slots.borrow().contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.slots.borrow().len()
    }
}

/// Handle to an armed timer. Dropping the handle cancels the timer.
pub struct Timer<'r, P: Platform> {
    rt: &'r Runtime<P>,
    id: TimerId,
}

impl<'r, P: Platform> Timer<'r, P> {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Wait for the next firing. Resolves to `None` once the timer has
    /// ended: a one-shot that already fired, or a cancelled timer whose
    /// delivered firings have all been consumed.
    pub fn next(&mut self) -> Next<'_> {
        Next {
            timers: &self.rt.timers,
            id: self.id,
        }
    }

    pub fn cancel(&self) {
        self.rt.cancel_timer(self.id);
    }
}

impl<P: Platform> Drop for Timer<'_, P> {
    fn drop(&mut self) {
        self.rt.cancel_timer(self.id);
        self.rt.timers.remove(self.id);
    }
}

/// Future returned by [`Timer::next`].
#[must_use = "futures do nothing unless polled"]
pub struct Next<'t> {
    timers: &'t TimerService,
    id: TimerId,
}

impl Future for Next<'_> {
    type Output = Option<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.timers.poll_fired(self.id, cx)
    }
}

impl<P: Platform> Runtime<P> {
    /// Arm a one-shot timer.
    pub fn after(&self, delay: Duration) -> Result<Timer<'_, P>, PlatformError> {
        self.arm(delay, false)
    }

    /// Arm a periodic timer. The platform re-arms it until cancelled.
    pub fn every(&self, period: Duration) -> Result<Timer<'_, P>, PlatformError> {
        self.arm(period, true)
    }

    /// Stop a timer by id. A firing delivered before this call is still
    /// observed once by the waiter.
    pub fn cancel_timer(&self, id: TimerId) {
        if self.timers.mark_cancelled(id) {
            trace!("cancelling timer {:?}", id);
            self.platform.timer_cancel(id);
        }
    }

    pub async fn sleep(&self, delay: Duration) -> Result<(), PlatformError> {
        let mut timer = self.after(delay)?;
        timer.next().await;
        Ok(())
    }

    fn arm(&self, delay: Duration, periodic: bool) -> Result<Timer<'_, P>, PlatformError> {
        let id = self.timers.register(periodic);
        if let Err(e) = self.platform.timer_arm(id, delay, periodic) {
            self.timers.remove(id);
            return Err(e);
        }
        trace!("armed timer {:?} for {} us (periodic: {})", id, delay.as_micros(), periodic);
        Ok(Timer { rt: self, id })
    }
}
