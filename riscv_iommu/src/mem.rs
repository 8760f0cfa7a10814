// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Downstream memory bus abstraction.
//!
//! The IOMMU reaches guest memory only through [`MemoryBus`] handles: one for
//! the downstream system address space (directory walks, queue records, MSI
//! forwards) and one per device for the MSI/MRIF trap region.

use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// An error returned by a [`MemoryBus`] access.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum BusError {
    /// No memory or device decodes the address.
    #[error("address decode error")]
    Decode,
    /// The target decoded the access but failed to complete it.
    #[error("bus access error")]
    Bus,
}

/// Backing implementation of an address space reachable through
/// [`MemoryBus`].
pub trait BusAccess: Send + Sync {
    /// Reads `data.len()` bytes at `addr`.
    fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), BusError>;
    /// Writes `data` at `addr`.
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), BusError>;
}

/// A cloneable handle to an address space.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<dyn BusAccess>,
}

impl Debug for MemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("MemoryBus")
    }
}

impl MemoryBus {
    pub fn new(access: impl BusAccess + 'static) -> Self {
        Self {
            inner: Arc::new(access),
        }
    }

    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), BusError> {
        self.inner.read(addr, data)
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), BusError> {
        self.inner.write(addr, data)
    }

    /// Reads a plain value at `addr`. Multi-byte fields are interpreted
    /// little-endian, matching the in-memory structure formats.
    pub fn read_plain<T: FromBytes + IntoBytes>(&self, addr: u64) -> Result<T, BusError> {
        let mut value = T::new_zeroed();
        self.inner.read(addr, value.as_mut_bytes())?;
        Ok(value)
    }

    /// Writes a plain value at `addr`.
    pub fn write_plain<T: IntoBytes + Immutable>(
        &self,
        addr: u64,
        value: &T,
    ) -> Result<(), BusError> {
        self.inner.write(addr, value.as_bytes())
    }
}
