//! Cooperative run-to-completion runtime.
//!
//! [`Runtime`] owns the platform and every registry that completions are
//! routed through: the resource lock, timers, in-flight bus transactions and
//! pin edge waiters. [`TaskQueue`] is kept separate so tasks can borrow the
//! runtime (and drivers built on it) for the lifetime of the queue.
//!
//! One scheduler pass drains the platform's event queue into the registries,
//! which wakes the affected tasks, then drains the task queue. When a pass
//! finds nothing to do the scheduler parks in [`Platform::wait_for_event`].

mod lock;
mod task_queue;
mod timer;

use core::cell::Cell;

use log::{debug, error, warn};

pub use lock::{Acquire, ResourceGuard, ResourceLock};
pub use task_queue::{TaskId, TaskQueue};
pub use timer::{Next, Timer};

use crate::bus::TransactionRegistry;
use crate::gpio::IrqTable;
use crate::platform::{HwEvent, Platform};
pub(crate) use timer::TimerService;

/// Unrecoverable conditions that stop the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// A transducer chip did not report ready after programming.
    AsicNotReady { address: u8, value: u8 },
}

pub struct Runtime<P> {
    pub(crate) platform: P,
    pub(crate) lock: ResourceLock,
    pub(crate) timers: TimerService,
    pub(crate) transactions: TransactionRegistry,
    pub(crate) irqs: IrqTable,
    halted: Cell<Option<HaltReason>>,
}

impl<P: Platform> Runtime<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            lock: ResourceLock::new(),
            timers: TimerService::new(),
            transactions: TransactionRegistry::new(),
            irqs: IrqTable::new(),
            halted: Cell::new(None),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// The lock serializing all traffic on the shared bus.
    pub fn bus_lock(&self) -> &ResourceLock {
        &self.lock
    }

    /// Stop dispatching work. The supervisor stops kicking the watchdog once
    /// it sees the halt, so the external watchdog resets the board.
    pub fn halt(&self, reason: HaltReason) {
        if self.halted.get().is_none() {
            error!("runtime halted: {:?}", reason);
            self.halted.set(Some(reason));
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.get().is_some()
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.halted.get()
    }

    /// Route every queued hardware event to its registry. Returns the number
    /// of events taken.
    pub fn dispatch_events(&self) -> usize {
        let mut count = 0;
        while let Some(event) = self.platform.take_event() {
            count += 1;
            match event {
                HwEvent::BusComplete { id, status, buffer } => {
                    if !self.transactions.complete(id, status, buffer) {
                        warn!("ignoring completion for unknown transaction {:?}", id);
                    }
                }
                HwEvent::TimerFired(id) => {
                    if !self.timers.fire(id) {
                        debug!("timer {:?} fired after it was released", id);
                    }
                }
                HwEvent::PinEdge(pin) => {
                    if !self.irqs.dispatch(pin) {
                        debug!("edge on {:?} with no waiter", pin);
                    }
                }
            }
        }
        count
    }

    /// One scheduler pass. Returns `true` if any event or task was processed.
    pub fn pass(&self, tasks: &TaskQueue<'_>) -> bool {
        if self.is_halted() {
            return false;
        }
        let events = self.dispatch_events();
        let ran = tasks.run_until_idle();
        events + ran > 0
    }

    /// Run passes until `done` reports completion, parking in the platform's
    /// idle wait whenever a pass finds no work. Gives up after `max_passes`.
    pub fn run_until(
        &self,
        tasks: &TaskQueue<'_>,
        max_passes: usize,
        mut done: impl FnMut() -> bool,
    ) -> bool {
        for _ in 0..max_passes {
            if done() {
                return true;
            }
            if !self.pass(tasks) {
                self.platform.wait_for_event();
            }
        }
        done()
    }

    /// The scheduler loop. Never returns; once halted it only parks.
    pub fn run_forever(&self, tasks: &TaskQueue<'_>) -> ! {
        loop {
            if !self.pass(tasks) {
                self.platform.wait_for_event();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;
    use core::cell::Cell;
    use embassy_time::Duration;

    #[test]
    fn test_halt_stops_dispatch() {
        let rt = Runtime::new(MockPlatform::new());
        let ran = Cell::new(false);
        let tasks = TaskQueue::new();

        rt.halt(HaltReason::AsicNotReady {
            address: 0x30,
            value: 0x00,
        });
        tasks.enqueue(|| ran.set(true));

        assert!(!rt.pass(&tasks));
        assert!(!ran.get());
        assert_eq!(
            rt.halt_reason(),
            Some(HaltReason::AsicNotReady {
                address: 0x30,
                value: 0x00
            })
        );
    }

    #[test]
    fn test_run_until_interleaves_timer_tasks() {
        let rt = Runtime::new(MockPlatform::new());
        let log = core::cell::RefCell::new(alloc::vec::Vec::new());
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            rt.sleep(Duration::from_millis(20)).await.unwrap();
            log.borrow_mut().push("slow");
        });
        tasks.spawn(async {
            rt.sleep(Duration::from_millis(5)).await.unwrap();
            log.borrow_mut().push("fast");
        });

        assert!(rt.run_until(&tasks, 100, || log.borrow().len() == 2));
        assert_eq!(*log.borrow(), alloc::vec!["fast", "slow"]);
    }
}
