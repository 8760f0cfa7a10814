// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Emulation of a RISC-V IOMMU.
//!
//! The device sits between DMA-capable endpoints and system memory. It
//! translates I/O virtual addresses through per-device translation contexts
//! loaded from guest-resident device and process directory tables, redirects
//! MSI writes through a programmable MSI page table, and exchanges commands
//! and events with driver software over three memory-resident queues.
//!
//! Endpoints obtain an [`IovaSpace`] keyed by requester id and call
//! [`IovaSpace::translate`]; driver software programs the device through
//! [`RiscvIommu::mmio_read`] and [`RiscvIommu::mmio_write`]. Interrupts are
//! raised through the `notify` callback supplied at construction.

#![forbid(unsafe_code)]

mod ctx;
mod mem;
mod msi;
mod queue;
mod regs;
mod space;

#[cfg(test)]
mod tests;

pub use mem::BusAccess;
pub use mem::BusError;
pub use mem::MemoryBus;
pub use space::IoTlbEntry;
pub use space::IommuPerm;
pub use space::IovaSpace;

use crate::ctx::CtxCache;
use crate::regs::load_le;
use crate::regs::RegisterFile;
use parking_lot::Mutex;
use riscv_iommu_spec as spec;
use riscv_iommu_spec::Register;
use std::sync::Arc;
use thiserror::Error;

const PAGE_SHIFT: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Reported physical address space width, in bits.
const PAS_BITS: u8 = 56;

fn ppn_phys(ppn: u64) -> u64 {
    ppn << PAGE_SHIFT
}

fn ppn_down(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

/// An error related to the suitability of an MMIO request for the register
/// window. Device-level error conditions latch status bits instead.
#[derive(Debug, Error)]
pub enum MmioError {
    /// The access length is not 1, 2, 4 or 8 bytes.
    #[error("invalid access size")]
    InvalidAccessSize,
    /// The offset is not aligned to the access length.
    #[error("unaligned register access")]
    UnalignedAccess,
    /// The access extends beyond the register window.
    #[error("access outside the register window")]
    OutOfRange,
}

/// Static configuration, fixed at construction.
#[derive(Debug, Copy, Clone)]
pub struct IommuParams {
    /// Reported architecture version.
    pub version: u8,
    /// PCI bus number used to compose requester ids for attached endpoints.
    pub bus: u8,
    /// Enables MSI redirection; selects the extended device context format.
    pub enable_msi: bool,
    /// Selects the out-of-reset directory mode: OFF (DMA disabled) when set,
    /// BARE (pass-through) otherwise.
    pub enable_off: bool,
}

impl Default for IommuParams {
    fn default() -> Self {
        Self {
            version: 0x10,
            bus: 0,
            enable_msi: true,
            enable_off: true,
        }
    }
}

type NotifyFn = Box<dyn Fn(u32) + Send + Sync>;
type ProcessFn = fn(&RiscvIommu, &mut CoreState);

/// Runtime ring state latched from the base registers when a queue is
/// enabled.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct Ring {
    pub addr: u64,
    pub mask: u32,
}

pub(crate) struct CoreState {
    /// Sanitized copy of the directory table pointer, the value directory
    /// walks use.
    pub ddtp: u64,
    pub cq: Ring,
    pub fq: Ring,
    pub pq: Ring,
    pub spaces: Vec<Arc<IovaSpace>>,
}

/// A RISC-V IOMMU instance.
pub struct RiscvIommu {
    cap: spec::Capabilities,
    bus: u8,
    enable_msi: bool,

    /// Guards the register byte arrays only; critical sections are a few
    /// loads and stores and never block on I/O.
    regs: Mutex<RegisterFile>,
    /// Serializes queue-engine actions and address-space list mutation.
    core: Mutex<CoreState>,
    cache: CtxCache,

    target: MemoryBus,
    notify: NotifyFn,
}

impl RiscvIommu {
    /// Creates a new IOMMU translating into `target` and signalling
    /// interrupt vectors through `notify`.
    pub fn new(
        target: MemoryBus,
        notify: impl Fn(u32) + Send + Sync + 'static,
        params: IommuParams,
    ) -> Arc<Self> {
        let cap = spec::Capabilities::new()
            .with_version(params.version)
            .with_msi_flat(params.enable_msi)
            .with_msi_mrif(params.enable_msi)
            .with_pas(PAS_BITS)
            .with_pd8(true);

        let mode = if params.enable_off {
            spec::DdtMode::OFF
        } else {
            spec::DdtMode::BARE
        };
        let ddtp = spec::Ddtp::new().with_mode(mode.0);

        let mut regs = RegisterFile::new();
        regs.set64(Register::CAP, cap.into());
        regs.set_ro32(
            Register::FCTL,
            !u32::from(spec::Fctl::new().with_be(true).with_wsi(true)),
        );
        regs.set_ro64(
            Register::DDTP,
            !u64::from(spec::Ddtp::new().with_mode(0xf).with_ppn((1 << 44) - 1)),
        );
        let qb_mask = !u64::from(
            spec::QueueBase::new()
                .with_log2sz(0x1f)
                .with_ppn((1 << 44) - 1),
        );
        regs.set_ro64(Register::CQB, qb_mask);
        regs.set_ro64(Register::FQB, qb_mask);
        regs.set_ro64(Register::PQB, qb_mask);
        regs.set_wc32(
            Register::CQCSR,
            spec::CqCsr::new()
                .with_cqmf(true)
                .with_cmd_to(true)
                .with_cmd_ill(true)
                .with_fence_w_ip(true)
                .into(),
        );
        regs.set_ro32(
            Register::CQCSR,
            spec::CqCsr::new().with_cqon(true).with_busy(true).into(),
        );
        regs.set_wc32(
            Register::FQCSR,
            spec::FqCsr::new().with_fqmf(true).with_fqof(true).into(),
        );
        regs.set_ro32(
            Register::FQCSR,
            spec::FqCsr::new().with_fqon(true).with_busy(true).into(),
        );
        regs.set_wc32(
            Register::PQCSR,
            spec::PqCsr::new().with_pqmf(true).with_pqof(true).into(),
        );
        regs.set_ro32(
            Register::PQCSR,
            spec::PqCsr::new().with_pqon(true).with_busy(true).into(),
        );
        regs.set_wc32(Register::IPSR, !0);
        regs.set_ro32(Register::IVEC, 0);
        regs.set64(Register::DDTP, ddtp.into());

        Arc::new(Self {
            cap,
            bus: params.bus,
            enable_msi: params.enable_msi,
            regs: Mutex::new(regs),
            core: Mutex::new(CoreState {
                ddtp: ddtp.into(),
                cq: Ring::default(),
                fq: Ring::default(),
                pq: Ring::default(),
                spaces: Vec::new(),
            }),
            cache: CtxCache::new(),
            target,
            notify: Box::new(notify),
        })
    }

    /// Reads a register at 1/2/4/8-byte width. The offset must be aligned to
    /// the access width and fall within the register window.
    pub fn mmio_read(&self, offset: u64, data: &mut [u8]) -> Result<(), MmioError> {
        let off = RegisterFile::check_access(offset, data.len())?;
        self.regs.lock().read(off, data);
        Ok(())
    }

    /// Writes a register and runs the processing the target register
    /// requires: directory pointer updates, queue doorbells, queue control
    /// transitions, and interrupt-pending recomputation.
    pub fn mmio_write(&self, offset: u64, data: &[u8]) -> Result<(), MmioError> {
        let off = RegisterFile::check_access(offset, data.len())?;
        let regb = Register(offset as u16 & !3);

        if regb == Register::IPSR {
            self.regs.lock().masked_write(off, data);
            self.update_ipsr((load_le(data) << ((offset & 3) * 8)) as u32);
            return Ok(());
        }

        // Track actionable writes. The busy bit is latched together with the
        // write and cleared when the processing completes.
        let (process, busy, busy_reg): (Option<ProcessFn>, u32, Register) =
            if regb == Register::DDTP || regb.0 == Register::DDTP.0 + 4 {
                (
                    Some(Self::process_ddtp),
                    u64::from(spec::Ddtp::new().with_busy(true)) as u32,
                    Register::DDTP,
                )
            } else if regb == Register::CQT {
                (Some(Self::process_cq_tail), 0, regb)
            } else if regb == Register::CQCSR {
                (
                    Some(Self::process_cq_control),
                    spec::CqCsr::new().with_busy(true).into(),
                    regb,
                )
            } else if regb == Register::FQCSR {
                (
                    Some(Self::process_fq_control),
                    spec::FqCsr::new().with_busy(true).into(),
                    regb,
                )
            } else if regb == Register::PQCSR {
                (
                    Some(Self::process_pq_control),
                    spec::PqCsr::new().with_busy(true).into(),
                    regb,
                )
            } else {
                (None, 0, regb)
            };

        {
            let mut regs = self.regs.lock();
            regs.masked_write(off, data);
            if busy != 0 {
                let val = regs.get32(busy_reg);
                regs.set32(busy_reg, val | busy);
            }
        }

        if let Some(process) = process {
            let mut core = self.core.lock();
            process(self, &mut core);
        }
        Ok(())
    }

    /// Applies a directory pointer update, enforcing the allowed mode
    /// transitions: `{OFF, BARE}` to any mode, multi-level modes only back to
    /// `{OFF, BARE}`. Rejected writes restore the previous value.
    fn process_ddtp(&self, core: &mut CoreState) {
        let old = spec::Ddtp::from(core.ddtp);
        let new = spec::Ddtp::from(self.reg_get64(Register::DDTP));
        let old_mode = spec::DdtMode(old.mode());
        let new_mode = spec::DdtMode(new.mode());

        let ok = match new_mode {
            spec::DdtMode::OFF | spec::DdtMode::BARE => true,
            spec::DdtMode::ONE_LVL | spec::DdtMode::TWO_LVL | spec::DdtMode::THREE_LVL => {
                new_mode == old_mode
                    || old_mode == spec::DdtMode::OFF
                    || old_mode == spec::DdtMode::BARE
            }
            _ => false,
        };

        // Report back the sanitized value: reserved and busy bits clear.
        let ddtp = if ok {
            spec::Ddtp::new()
                .with_mode(new.mode())
                .with_ppn(new.ppn())
                .into()
        } else {
            core.ddtp
        };
        core.ddtp = ddtp;
        self.reg_set64(Register::DDTP, ddtp);
    }

    /// Recomputes interrupt-pending bits for each source the driver wrote
    /// one to: a source with a masked, enabled, still-latched condition
    /// remains pending, otherwise the bit stays cleared.
    fn update_ipsr(&self, written: u32) {
        let written = spec::Ipsr::from(written);
        let mut set = spec::Ipsr::new();
        let mut clr = spec::Ipsr::new();

        if written.cip() {
            let cqcsr = spec::CqCsr::from(self.reg_get32(Register::CQCSR));
            if cqcsr.cie()
                && (cqcsr.fence_w_ip() || cqcsr.cmd_ill() || cqcsr.cmd_to() || cqcsr.cqmf())
            {
                set.set_cip(true);
            } else {
                clr.set_cip(true);
            }
        }

        if written.fip() {
            let fqcsr = spec::FqCsr::from(self.reg_get32(Register::FQCSR));
            if fqcsr.fie() && (fqcsr.fqof() || fqcsr.fqmf()) {
                set.set_fip(true);
            } else {
                clr.set_fip(true);
            }
        }

        if written.pip() {
            let pqcsr = spec::PqCsr::from(self.reg_get32(Register::PQCSR));
            if pqcsr.pie() && (pqcsr.pqof() || pqcsr.pqmf()) {
                set.set_pip(true);
            } else {
                clr.set_pip(true);
            }
        }

        self.reg_mod32(Register::IPSR, set.into(), clr.into());
    }

    /// Latches the pending bit for an interrupt source and, on the
    /// not-pending to pending edge, signals the mapped vector. Wire-signaled
    /// mode leaves delivery to the host bridge.
    pub(crate) fn notify_intr(&self, vec: u32) {
        let fctl = spec::Fctl::from(self.reg_get32(Register::FCTL));
        if fctl.wsi() {
            return;
        }

        let ipsr = self.reg_mod32(Register::IPSR, 1 << vec, 0);
        if ipsr & (1 << vec) == 0 {
            let ivec = self.reg_get32(Register::IVEC);
            (self.notify)((ivec >> (vec * 4)) & 0xf);
        }
    }

    pub(crate) fn reg_get32(&self, reg: Register) -> u32 {
        self.regs.lock().get32(reg)
    }

    pub(crate) fn reg_set32(&self, reg: Register, value: u32) {
        self.regs.lock().set32(reg, value)
    }

    pub(crate) fn reg_mod32(&self, reg: Register, set: u32, clr: u32) -> u32 {
        self.regs.lock().mod32(reg, set, clr)
    }

    pub(crate) fn reg_get64(&self, reg: Register) -> u64 {
        self.regs.lock().get64(reg)
    }

    pub(crate) fn reg_set64(&self, reg: Register, value: u64) {
        self.regs.lock().set64(reg, value)
    }

    pub(crate) fn reg_set_ro32(&self, reg: Register, mask: u32) {
        self.regs.lock().set_ro32(reg, mask)
    }
}
