// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-device I/O address spaces, the translation entry point presented to
//! endpoints.

use crate::ctx::Ctx;
use crate::BusAccess;
use crate::BusError;
use crate::MemoryBus;
use crate::RiscvIommu;
use crate::PAGE_OFFSET_MASK;
use open_enum::open_enum;
use riscv_iommu_spec as spec;
use riscv_iommu_spec::ddt;
use riscv_iommu_spec::FaultCause;
use riscv_iommu_spec::TransactionType;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

#[open_enum]
#[derive(Clone, Copy, Debug, Hash, Ord, PartialOrd)]
#[repr(u8)]
/// Access permissions for a DMA translation request.
pub enum IommuPerm {
    NONE = 0,
    RO = 1,
    WO = 2,
    RW = 3,
}

impl IommuPerm {
    pub fn readable(self) -> bool {
        self.0 & IommuPerm::RO.0 != 0
    }

    pub fn writable(self) -> bool {
        self.0 & IommuPerm::WO.0 != 0
    }
}

/// The result of a translation request.
///
/// The entry covers the addresses matching `iova` under `addr_mask`; the
/// endpoint performs its access at `translated_addr` in `target_as`. A
/// failed translation carries `addr_mask == 0` and no permissions.
#[derive(Debug, Clone)]
pub struct IoTlbEntry {
    pub iova: u64,
    pub translated_addr: u64,
    pub addr_mask: u64,
    pub perm: IommuPerm,
    pub target_as: MemoryBus,
}

/// The I/O virtual address space assigned to one requester id.
///
/// Created on first lookup through [`RiscvIommu::address_space`] and lives
/// for the IOMMU's lifetime.
pub struct IovaSpace {
    iommu: Weak<RiscvIommu>,
    devid: u32,
    /// Trap space for this device's MSI writes; carries the requester id the
    /// redirector needs.
    trap: MemoryBus,
    notifier: AtomicBool,
}

/// Backing for the MSI/MRIF trap region: writes feed the redirector, reads
/// always fail.
struct TrapAccess {
    iommu: Weak<RiscvIommu>,
    devid: u32,
}

impl BusAccess for TrapAccess {
    fn read(&self, _addr: u64, _data: &mut [u8]) -> Result<(), BusError> {
        Err(BusError::Bus)
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), BusError> {
        let iommu = self.iommu.upgrade().ok_or(BusError::Bus)?;
        iommu.trap_write(self.devid, addr, data)
    }
}

impl IovaSpace {
    /// The requester id this space serves.
    pub fn devid(&self) -> u32 {
        self.devid
    }

    /// Translates a DMA access for this device.
    ///
    /// A fault is reported through the fault queue (or as a page request for
    /// devices opted into automatic page-request generation) and yields an
    /// entry with no permissions.
    pub fn translate(&self, process_id: u32, iova: u64, perm: IommuPerm) -> IoTlbEntry {
        let Some(iommu) = self.iommu.upgrade() else {
            return IoTlbEntry {
                iova,
                translated_addr: 0,
                addr_mask: 0,
                perm: IommuPerm::NONE,
                target_as: self.trap.clone(),
            };
        };

        let mut entry = IoTlbEntry {
            iova,
            translated_addr: 0,
            addr_mask: !0,
            perm,
            target_as: iommu.target.clone(),
        };

        let ok = match iommu.ctx(self.devid, process_id) {
            Ok(handle) => {
                let ctx = handle.snapshot();
                iommu.translate(&ctx, &self.trap, &mut entry).is_ok()
            }
            // Translation disabled or the context is invalid; the walk
            // reported the fault already.
            Err(_) => false,
        };
        if !ok {
            entry.addr_mask = 0;
            entry.perm = IommuPerm::NONE;
        }

        tracing::trace!(
            devid = self.devid,
            process_id,
            iova,
            translated = entry.translated_addr,
            perm = entry.perm.0,
            "dma"
        );
        entry
    }

    /// Tracks whether the endpoint has mapping-change notifiers registered.
    pub fn notifier_flag_changed(&self, enabled: bool) {
        self.notifier.store(enabled, Ordering::Relaxed);
        tracing::trace!(devid = self.devid, enabled, "notifier");
    }

    pub fn notifier_enabled(&self) -> bool {
        self.notifier.load(Ordering::Relaxed)
    }
}

impl RiscvIommu {
    /// Finds or creates the address space for a device function. The
    /// requester id combines the configured bus number with `devfn`.
    pub fn address_space(self: &Arc<Self>, devfn: u8) -> Arc<IovaSpace> {
        let devid = u32::from(self.bus) << 8 | u32::from(devfn);

        let mut core = self.core.lock();
        if let Some(space) = core.spaces.iter().find(|space| space.devid == devid) {
            return space.clone();
        }

        let space = Arc::new(IovaSpace {
            iommu: Arc::downgrade(self),
            devid,
            trap: MemoryBus::new(TrapAccess {
                iommu: Arc::downgrade(self),
                devid,
            }),
            notifier: AtomicBool::new(false),
        });
        core.spaces.push(space.clone());
        tracing::debug!(devid, "new iova space");
        space
    }

    /// Translates one access using a materialized context, filling `entry`.
    pub(crate) fn translate(
        &self,
        ctx: &Ctx,
        trap: &MemoryBus,
        entry: &mut IoTlbEntry,
    ) -> Result<(), FaultCause> {
        let tc = ddt::Tc::from(ctx.tc);
        let req_perm = entry.perm;
        // Permission-less requests are ATS probes; devices opted in through
        // the custom control bit get a page request instead of a fault.
        let enable_pri = req_perm == IommuPerm::NONE && tc.auto_page_request();
        let enable_pasid = tc.pdtv();

        if let Err(cause) = self.spa_fetch(ctx, trap, entry) {
            if enable_pri {
                let mut hdr = spec::PqHeader::new().with_did(ctx.devid);
                if enable_pasid {
                    hdr = hdr.with_pv(true).with_pid(ctx.process_id);
                }
                self.pri(spec::PqRecord {
                    hdr,
                    payload: (entry.iova & !PAGE_OFFSET_MASK) | spec::PQ_PAYLOAD_M,
                });
                return Err(cause);
            }

            let ttype = if req_perm.writable() {
                TransactionType::UADDR_WR
            } else {
                TransactionType::UADDR_RD
            };
            self.report_fault(
                ctx,
                ttype,
                cause,
                enable_pasid,
                entry.iova,
                entry.translated_addr,
            );
            return Err(cause);
        }
        Ok(())
    }

    /// Resolves the target address for one access.
    ///
    /// Writes matching the context's MSI filter are steered to the trap
    /// space at their untranslated address; everything else passes through
    /// identity-mapped. Page table walks are the extension point here.
    fn spa_fetch(
        &self,
        ctx: &Ctx,
        trap: &MemoryBus,
        entry: &mut IoTlbEntry,
    ) -> Result<(), FaultCause> {
        if entry.perm.writable() && ctx.msi_check(entry.iova) {
            entry.target_as = trap.clone();
            entry.translated_addr = entry.iova;
            entry.addr_mask = PAGE_OFFSET_MASK;
            return Ok(());
        }

        entry.translated_addr = entry.iova;
        entry.addr_mask = PAGE_OFFSET_MASK;
        // Pass-through grants read and write.
        entry.perm = IommuPerm::RW;
        Ok(())
    }
}
