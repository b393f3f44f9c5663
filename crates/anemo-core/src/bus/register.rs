//! Register access composed from single bus operations.
//!
//! A register read is an address-select write followed by a repeated-start
//! read. Both halves run under one hold of the bus lock so no other traffic
//! can land between them. The `*_locked` variants take an existing guard for
//! sequences that already hold the lock.

use alloc::vec;
use alloc::vec::Vec;

use super::{BusAddress, BusError, BusFlags};
use crate::platform::Platform;
use crate::runtime::{ResourceGuard, Runtime};

impl<P: Platform> Runtime<P> {
    /// Read `len` bytes starting at `register`.
    pub async fn read_register(
        &self,
        address: BusAddress,
        register: u8,
        len: usize,
    ) -> Result<Vec<u8>, BusError> {
        let guard = self.bus_lock().acquire().await;
        self.read_register_locked(&guard, address, register, len).await
    }

    pub async fn read_register_locked(
        &self,
        guard: &ResourceGuard<'_>,
        address: BusAddress,
        register: u8,
        len: usize,
    ) -> Result<Vec<u8>, BusError> {
        debug_assert!(guard.belongs_to(self.bus_lock()), "guard is not for the bus lock");
        self.write(address, BusFlags::START, vec![register])
            .await
            .into_result()?;
        self.read(address, BusFlags::RESTART | BusFlags::STOP, Vec::new(), len)
            .await
            .into_result()
    }

    /// Write `register` followed by `contents` as one framed operation.
    pub async fn write_register(
        &self,
        address: BusAddress,
        register: u8,
        contents: &[u8],
    ) -> Result<(), BusError> {
        let guard = self.bus_lock().acquire().await;
        self.write_register_locked(&guard, address, register, contents)
            .await
    }

    pub async fn write_register_locked(
        &self,
        guard: &ResourceGuard<'_>,
        address: BusAddress,
        register: u8,
        contents: &[u8],
    ) -> Result<(), BusError> {
        debug_assert!(guard.belongs_to(self.bus_lock()), "guard is not for the bus lock");
        let mut payload = Vec::with_capacity(contents.len() + 1);
        payload.push(register);
        payload.extend_from_slice(contents);
        self.write(address, BusFlags::START | BusFlags::STOP, payload)
            .await
            .into_result()
            .map(|_| ())
    }
}
