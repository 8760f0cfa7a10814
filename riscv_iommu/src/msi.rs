// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MSI and MRIF redirection.
//!
//! Writes matching a device's MSI address filter are steered to the trap
//! space; this module resolves them through the MSI page table, either
//! forwarding the write (basic mode) or updating the memory-resident
//! interrupt file and sending a notice message (MRIF mode).

use crate::ctx::Ctx;
use crate::ppn_phys;
use crate::ppn_down;
use crate::regs::load_le;
use crate::BusError;
use crate::RiscvIommu;
use crate::PAGE_OFFSET_MASK;
use riscv_iommu_spec::ddt;
use riscv_iommu_spec::FaultCause;
use riscv_iommu_spec::TransactionType;

/// A failed redirection step: the cause to report and the bus-level error to
/// surface to the writer.
struct MsiFault {
    cause: FaultCause,
    err: BusError,
}

fn fail(cause: FaultCause) -> MsiFault {
    MsiFault {
        cause,
        err: BusError::Bus,
    }
}

/// Portable bit-mask extraction: compresses the bits of `val` selected by
/// `ext` to the low end of the result, in ascending order.
pub(crate) fn pext(mut val: u64, mut ext: u64) -> u64 {
    let mut ret = 0;
    let mut rot = 1;
    while ext != 0 {
        if ext & 1 != 0 {
            if val & 1 != 0 {
                ret |= rot;
            }
            rot <<= 1;
        }
        val >>= 1;
        ext >>= 1;
    }
    ret
}

impl RiscvIommu {
    /// Resolves an MSI write trapped for `ctx`. Terminal failures enqueue a
    /// fault record and surface as a bus error to the writer.
    pub(crate) fn msi_write(&self, ctx: &Ctx, gpa: u64, data: &[u8]) -> Result<(), BusError> {
        match self.msi_redirect(ctx, gpa, data) {
            Ok(()) => Ok(()),
            Err(MsiFault { cause, err }) => {
                self.report_fault(
                    ctx,
                    TransactionType::UADDR_WR,
                    cause,
                    ctx.process_id != 0,
                    0,
                    0,
                );
                Err(err)
            }
        }
    }

    fn msi_redirect(&self, ctx: &Ctx, gpa: u64, data: &[u8]) -> Result<(), MsiFault> {
        if !ctx.msi_check(gpa) {
            return Err(fail(FaultCause::MSI_LOAD_FAULT));
        }

        // Interrupt file number, gathered from the PPN bits the address mask
        // selects.
        let intn = pext(ppn_down(gpa), ctx.msi_addr_mask);
        if intn >= 256 {
            return Err(fail(FaultCause::MSI_LOAD_FAULT));
        }

        let pte_addr = ppn_phys(ddt::Msiptp::from(ctx.msiptp).ppn())
            | intn * size_of::<ddt::MsiPte>() as u64;
        let pte: ddt::MsiPte = self.target.read_plain(pte_addr).map_err(|err| MsiFault {
            cause: match err {
                BusError::Decode => FaultCause::MSI_PT_CORRUPTED,
                BusError::Bus => FaultCause::MSI_LOAD_FAULT,
            },
            err,
        })?;

        let pte0 = ddt::MsiPteBasic::from(pte.pte0);
        if !pte0.v() || pte0.c() {
            return Err(fail(FaultCause::MSI_INVALID));
        }

        match pte0.m() {
            ddt::MSI_PTE_M_BASIC => {
                // MSI pass-through: forward the write into the target
                // interrupt file page.
                let addr = ppn_phys(pte0.ppn()) | (gpa & PAGE_OFFSET_MASK);
                tracing::trace!(devid = ctx.devid, gpa, addr, "msi");
                self.target.write(addr, data).map_err(|err| MsiFault {
                    cause: FaultCause::MSI_WR_FAULT,
                    err,
                })?;
                Ok(())
            }
            ddt::MSI_PTE_M_MRIF => self.mrif_update(ctx, gpa, load_le(data), pte),
            _ => Err(fail(FaultCause::MSI_MISCONFIGURED)),
        }
    }

    /// MRIF mode: sets the interrupt's pending bit in the memory-resident
    /// file (non-atomically) and, when the matching enable bit is set, sends
    /// the notice message.
    fn mrif_update(&self, ctx: &Ctx, gpa: u64, data: u64, pte: ddt::MsiPte) -> Result<(), MsiFault> {
        // Interrupt identities are limited to the interrupt file size and the
        // destination must be 32-bit aligned.
        if data > 2047 || gpa & 3 != 0 {
            return Err(fail(FaultCause::MSI_MISCONFIGURED));
        }

        let mrif = ddt::MsiPteMrif::from(pte.pte0);
        let addr = (mrif.mrif_addr() << 9) | ((data & 0x7c0) >> 3);
        let bit = 1u64 << (data & 0x3f);
        tracing::trace!(devid = ctx.devid, gpa, addr, "msi mrif");

        let pending: u64 = self.target.read_plain(addr).map_err(|err| MsiFault {
            cause: FaultCause::MSI_LOAD_FAULT,
            err,
        })?;
        self.target
            .write_plain(addr, &(pending | bit))
            .map_err(|err| MsiFault {
                cause: FaultCause::MSI_WR_FAULT,
                err,
            })?;

        let enable: u64 = self.target.read_plain(addr + 8).map_err(|err| MsiFault {
            cause: FaultCause::MSI_LOAD_FAULT,
            err,
        })?;
        if enable & bit == 0 {
            // Notification disabled, the pending-bit update completes the
            // delivery.
            return Ok(());
        }

        let notice = ddt::MsiMrifNotice::from(pte.pte1);
        let nid = u32::from(notice.nid()) | (u32::from(notice.nid_msb()) << 10);
        self.target
            .write_plain(ppn_phys(notice.nppn()), &nid)
            .map_err(|err| MsiFault {
                cause: FaultCause::MSI_WR_FAULT,
                err,
            })?;
        Ok(())
    }

    /// Entry point for writes reaching a device's trap space. The context is
    /// refetched for the requester with no process id, as MSI transactions
    /// carry none.
    pub(crate) fn trap_write(&self, devid: u32, addr: u64, data: &[u8]) -> Result<(), BusError> {
        let entry = self.ctx(devid, 0).map_err(|_| BusError::Bus)?;
        self.msi_write(&entry.snapshot(), addr, data)
    }
}
