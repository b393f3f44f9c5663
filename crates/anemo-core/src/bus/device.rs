//! `embedded-hal-async` I2C device over the transaction layer.
//!
//! Lets generic device drivers share the external bus with the transducer
//! chips. Each `transaction` call holds the bus lock for its whole duration,
//! so its operations reach the bus back to back.

use alloc::vec::Vec;

use embedded_hal_async::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};

use super::{BusAddress, BusError, BusFlags};
use crate::platform::Platform;
use crate::runtime::Runtime;

impl embedded_hal_async::i2c::Error for BusError {
    fn kind(&self) -> ErrorKind {
        match self {
            BusError::DataNak => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data),
            BusError::AddressNak => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address),
            BusError::Bus => ErrorKind::Bus,
            BusError::ArbitrationLost => ErrorKind::ArbitrationLoss,
            BusError::CouldNotIssue => ErrorKind::Other,
        }
    }
}

/// I2C device handle on the external bus. Any number of handles may exist;
/// they serialize through the runtime's bus lock.
pub struct BusDevice<'r, P> {
    rt: &'r Runtime<P>,
}

impl<'r, P: Platform> BusDevice<'r, P> {
    #[inline]
    pub const fn new(rt: &'r Runtime<P>) -> Self {
        Self { rt }
    }
}

impl<P: Platform> ErrorType for BusDevice<'_, P> {
    type Error = BusError;
}

impl<P: Platform> I2c for BusDevice<'_, P> {
    async fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let _guard = self.rt.bus_lock().acquire().await;
        let target = BusAddress::External(address << 1);
        let count = operations.len();
        let mut previous_read: Option<bool> = None;

        for (index, operation) in operations.iter_mut().enumerate() {
            let is_read = matches!(operation, Operation::Read(_));
            let mut flags = match previous_read {
                None => BusFlags::START,
                Some(prev) if prev != is_read => BusFlags::RESTART,
                Some(_) => BusFlags::NONE,
            };
            if index + 1 == count {
                flags |= BusFlags::STOP;
            }

            match operation {
                Operation::Write(bytes) => {
                    self.rt
                        .write(target, flags, bytes.to_vec())
                        .await
                        .into_result()?;
                }
                Operation::Read(buffer) => {
                    let data = self
                        .rt
                        .read(target, flags, Vec::new(), buffer.len())
                        .await
                        .into_result()?;
                    let n = data.len().min(buffer.len());
                    buffer[..n].copy_from_slice(&data[..n]);
                }
            }
            previous_read = Some(is_read);
        }
        Ok(())
    }
}
