//! Event-driven transactions on the shared two-wire bus.
//!
//! Every write or read gets a slot in the runtime's [`TransactionRegistry`]
//! before it is handed to the platform. The platform later queues a
//! completion event for that id; dispatch moves the status and buffer into
//! the slot and wakes the awaiting task, which takes them and frees the
//! slot. Nothing here retries: the status goes to the nearest caller.

mod device;
mod register;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use bitflags::bitflags;
use log::{trace, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

pub use device::BusDevice;

use crate::platform::{BusOp, BusRequest, Platform, TransactionId};
use crate::runtime::Runtime;

bitflags! {
    /// Framing of one bus operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BusFlags: u32 {
        /// Emit a start condition before the operation.
        const START = 1;
        /// Acknowledge the final byte of a read.
        const ACK_LAST = 2;
        /// Emit a stop condition after the operation.
        const STOP = 4;
    }
}

impl BusFlags {
    pub const NONE: Self = Self::empty();
    /// A repeated start is encoded the same as a start.
    pub const RESTART: Self = Self::START;
}

/// Device address on one of the board's two buses, in 8-bit form
/// (7-bit address shifted left, R/W bit clear).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BusAddress {
    External(u8),
    Internal(u8),
}

impl BusAddress {
    /// Numeric form used by board support code.
    pub const fn raw(self) -> u16 {
        match self {
            BusAddress::External(addr) => 0x100 + addr as u16,
            BusAddress::Internal(addr) => 0x200 + addr as u16,
        }
    }
}

/// Completion status reported by the bus hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    Ok,
    DataNak,
    AddressNak,
    BusError,
    ArbitrationLost,
    CouldNotIssue,
}

impl BusStatus {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => BusStatus::Ok,
            1 => BusStatus::DataNak,
            2 => BusStatus::AddressNak,
            3 => BusStatus::BusError,
            4 => BusStatus::ArbitrationLost,
            5 => BusStatus::CouldNotIssue,
            other => {
                warn!("unknown bus status code {}", other);
                BusStatus::BusError
            }
        }
    }

    pub fn code(self) -> u32 {
        match self {
            BusStatus::Ok => 0,
            BusStatus::DataNak => 1,
            BusStatus::AddressNak => 2,
            BusStatus::BusError => 3,
            BusStatus::ArbitrationLost => 4,
            BusStatus::CouldNotIssue => 5,
        }
    }

    /// Short mnemonic for logs.
    pub fn decode(self) -> &'static str {
        match self {
            BusStatus::Ok => "OK",
            BusStatus::DataNak => "DNAK",
            BusStatus::AddressNak => "ANAK",
            BusStatus::BusError => "ERR",
            BusStatus::ArbitrationLost => "ARBLST",
            BusStatus::CouldNotIssue => "SYSCALL",
        }
    }

    pub fn into_result(self) -> Result<(), BusError> {
        match self {
            BusStatus::Ok => Ok(()),
            BusStatus::DataNak => Err(BusError::DataNak),
            BusStatus::AddressNak => Err(BusError::AddressNak),
            BusStatus::BusError => Err(BusError::Bus),
            BusStatus::ArbitrationLost => Err(BusError::ArbitrationLost),
            BusStatus::CouldNotIssue => Err(BusError::CouldNotIssue),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("data byte not acknowledged")]
    DataNak,
    #[error("address not acknowledged")]
    AddressNak,
    #[error("bus error")]
    Bus,
    #[error("arbitration lost")]
    ArbitrationLost,
    #[error("transaction could not be issued")]
    CouldNotIssue,
}

impl From<BusError> for BusStatus {
    fn from(error: BusError) -> Self {
        match error {
            BusError::DataNak => BusStatus::DataNak,
            BusError::AddressNak => BusStatus::AddressNak,
            BusError::Bus => BusStatus::BusError,
            BusError::ArbitrationLost => BusStatus::ArbitrationLost,
            BusError::CouldNotIssue => BusStatus::CouldNotIssue,
        }
    }
}

/// Outcome of one bus operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub status: BusStatus,
    /// The written payload, or the bytes read.
    pub buffer: Vec<u8>,
}

impl Completion {
    pub fn into_result(self) -> Result<Vec<u8>, BusError> {
        self.status.into_result().map(|()| self.buffer)
    }
}

// -----------------------------------------------------------------------------
// Registry
// -----------------------------------------------------------------------------

enum Slot {
    Pending(Option<Waker>),
    Complete(Completion),
    /// The awaiting future was dropped; the completion only frees the slot.
    Abandoned,
}

pub(crate) struct TransactionRegistry {
    slots: RefCell<BTreeMap<TransactionId, Slot>>,
    next_id: Cell<u32>,
}

impl TransactionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(0),
        }
    }

    fn open(&self) -> TransactionId {
        let mut slots = self.slots.borrow_mut();
        let mut id = TransactionId(self.next_id.get());
        while slots.contains_key(&id) {
            id = TransactionId(id.0.wrapping_add(1));
        }
        self.next_id.set(id.0.wrapping_add(1));
        slots.insert(id, Slot::Pending(None));
        id
    }

    fn discard(&self, id: TransactionId) {
        self.slots.borrow_mut().remove(&id);
    }

    /// Deliver a hardware completion. Returns `false` for an unknown or
    /// already-completed id.
    pub(crate) fn complete(&self, id: TransactionId, status: BusStatus, buffer: Vec<u8>) -> bool {
        let waker = {
            let mut slots = self.slots.borrow_mut();
            match slots.remove(&id) {
                Some(Slot::Pending(waker)) => {
                    slots.insert(id, Slot::Complete(Completion { status, buffer }));
                    waker
                }
                Some(Slot::Abandoned) => {
                    trace!("transaction {:?} completed after its waiter left", id);
                    return true;
                }
                Some(done @ Slot::Complete(_)) => {
                    slots.insert(id, done);
                    return false;
                }
                None => return false,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    fn poll(&self, id: TransactionId, cx: &mut Context<'_>) -> Poll<Completion> {
        let mut slots = self.slots.borrow_mut();
        match slots.remove(&id) {
            Some(Slot::Complete(completion)) => Poll::Ready(completion),
            Some(Slot::Pending(_)) => {
                slots.insert(id, Slot::Pending(Some(cx.waker().clone())));
                Poll::Pending
            }
            // Only reachable if the id was never ours; report it as unissued
            Some(Slot::Abandoned) | None => Poll::Ready(Completion {
                status: BusStatus::CouldNotIssue,
                buffer: Vec::new(),
            }),
        }
    }

    fn abandon(&self, id: TransactionId) {
        let mut slots = self.slots.borrow_mut();
        if let Some(Slot::Pending(_)) = slots.remove(&id) {
            slots.insert(id, Slot::Abandoned);
        }
    }

    /// Transactions issued and not yet consumed.
    pub(crate) fn in_flight(&self) -> usize {
        self.slots.borrow().len()
    }
}

// -----------------------------------------------------------------------------
// Futures
// -----------------------------------------------------------------------------

enum TransactionState {
    Issued(TransactionId),
    Rejected(Vec<u8>),
    Done,
}

/// Future for one bus operation, yielding its [`Completion`].
///
/// Dropping it does not stop the hardware; the completion is still
/// delivered and frees the registry slot.
#[must_use = "futures do nothing unless polled"]
pub struct Transaction<'r> {
    registry: &'r TransactionRegistry,
    state: TransactionState,
}

impl Future for Transaction<'_> {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Completion> {
        let this = &mut *self;
        match core::mem::replace(&mut this.state, TransactionState::Done) {
            TransactionState::Issued(id) => match this.registry.poll(id, cx) {
                Poll::Ready(completion) => Poll::Ready(completion),
                Poll::Pending => {
                    this.state = TransactionState::Issued(id);
                    Poll::Pending
                }
            },
            TransactionState::Rejected(buffer) => Poll::Ready(Completion {
                status: BusStatus::CouldNotIssue,
                buffer,
            }),
            TransactionState::Done => panic!("Transaction polled after completion"),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let TransactionState::Issued(id) = self.state {
            self.registry.abandon(id);
        }
    }
}

impl<P: Platform> Runtime<P> {
    /// Issue a write of `payload` to `address`.
    pub fn write(&self, address: BusAddress, flags: BusFlags, payload: Vec<u8>) -> Transaction<'_> {
        self.issue(BusRequest {
            address,
            flags,
            op: BusOp::Write,
            buffer: payload,
        })
    }

    /// Issue a read of `len` bytes from `address` into `target`.
    pub fn read(
        &self,
        address: BusAddress,
        flags: BusFlags,
        mut target: Vec<u8>,
        len: usize,
    ) -> Transaction<'_> {
        target.clear();
        target.resize(len, 0);
        self.issue(BusRequest {
            address,
            flags,
            op: BusOp::Read,
            buffer: target,
        })
    }

    /// Bus operations issued whose completion has not been consumed.
    pub fn transactions_in_flight(&self) -> usize {
        self.transactions.in_flight()
    }

    fn issue(&self, request: BusRequest) -> Transaction<'_> {
        let id = self.transactions.open();
        trace!(
            "bus {:?} {:?} {:#05x} flags {:?} ({} bytes)",
            id,
            request.op,
            request.address.raw(),
            request.flags,
            request.buffer.len()
        );

        let state = match self.platform.bus_issue(id, request) {
            Ok(()) => TransactionState::Issued(id),
            Err(rejected) => {
                warn!(
                    "bus transaction to {:#05x} could not be issued",
                    rejected.address.raw()
                );
                self.transactions.discard(id);
                TransactionState::Rejected(rejected.buffer)
            }
        };

        Transaction {
            registry: &self.transactions,
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;
    use crate::runtime::TaskQueue;
    use alloc::vec;

    const DEVICE: BusAddress = BusAddress::External(0x50);

    #[test]
    fn test_flags_compose() {
        let flags = BusFlags::RESTART | BusFlags::STOP;
        assert_eq!(flags.bits(), 5);
        assert_eq!(BusFlags::RESTART, BusFlags::START);
        assert_eq!(BusFlags::NONE.bits(), 0);
        assert_eq!((BusFlags::START | BusFlags::ACK_LAST | BusFlags::STOP).bits(), 7);
    }

    #[test]
    fn test_address_encoding() {
        assert_eq!(BusAddress::External(0x8A).raw(), 0x18A);
        assert_eq!(BusAddress::Internal(0x30).raw(), 0x230);
    }

    #[test]
    fn test_status_codes() {
        for code in 0..6 {
            assert_eq!(BusStatus::from_code(code).code(), code);
        }
        assert_eq!(BusStatus::from_code(99), BusStatus::BusError);
        assert_eq!(BusStatus::DataNak.decode(), "DNAK");
        assert_eq!(BusStatus::AddressNak.into_result(), Err(BusError::AddressNak));
    }

    #[test]
    fn test_completion_delivered_once_with_status_and_buffer() {
        let platform = MockPlatform::new();
        platform.set_auto_complete(false);
        let rt = Runtime::new(platform);
        let result = RefCell::new(None);
        let polls = Cell::new(0);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            let completion = rt.read(DEVICE, BusFlags::START | BusFlags::STOP, Vec::new(), 3).await;
            polls.set(polls.get() + 1);
            *result.borrow_mut() = Some(completion);
        });
        rt.pass(&tasks);

        let issued = rt.platform().held_requests();
        assert_eq!(issued.len(), 1);
        let (id, request) = &issued[0];
        assert_eq!(request.buffer.len(), 3);
        assert_eq!(rt.transactions_in_flight(), 1);

        rt.platform().complete(*id, BusStatus::DataNak, vec![1, 2, 3]);
        // A duplicate completion for the same id is ignored
        rt.platform().complete(*id, BusStatus::Ok, vec![9, 9, 9]);
        rt.pass(&tasks);
        rt.pass(&tasks);

        assert_eq!(polls.get(), 1);
        assert_eq!(
            result.borrow_mut().take(),
            Some(Completion {
                status: BusStatus::DataNak,
                buffer: vec![1, 2, 3],
            })
        );
        assert_eq!(rt.transactions_in_flight(), 0);
    }

    #[test]
    fn test_unknown_completion_is_ignored() {
        let rt = Runtime::new(MockPlatform::new());
        rt.platform().complete(TransactionId(42), BusStatus::Ok, Vec::new());
        assert_eq!(rt.dispatch_events(), 1);
        assert_eq!(rt.transactions_in_flight(), 0);
    }

    #[test]
    fn test_rejected_issue_reports_could_not_issue() {
        let rt = Runtime::new(MockPlatform::new());
        rt.platform().reject_next_issue();
        let result = RefCell::new(None);
        let tasks = TaskQueue::new();

        tasks.spawn(async {
            *result.borrow_mut() = Some(rt.write(DEVICE, BusFlags::START, vec![0x01]).await);
        });
        assert!(rt.run_until(&tasks, 10, || result.borrow().is_some()));

        let completion = result.borrow_mut().take().unwrap();
        assert_eq!(completion.status, BusStatus::CouldNotIssue);
        assert_eq!(completion.buffer, vec![0x01]);
        assert_eq!(rt.transactions_in_flight(), 0);
    }

    #[test]
    fn test_dropped_transaction_still_frees_slot() {
        let platform = MockPlatform::new();
        platform.set_auto_complete(false);
        let rt = Runtime::new(platform);

        let transaction = rt.write(DEVICE, BusFlags::START | BusFlags::STOP, vec![0xAA]);
        drop(transaction);
        assert_eq!(rt.transactions_in_flight(), 1);

        let (id, _) = rt.platform().held_requests()[0].clone();
        rt.platform().complete(id, BusStatus::Ok, vec![0xAA]);
        rt.dispatch_events();
        assert_eq!(rt.transactions_in_flight(), 0);
    }
}
