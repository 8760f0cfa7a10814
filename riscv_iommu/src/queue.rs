// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The three memory-resident queues: the command queue consumer and the
//! fault and page-request producers, with their enable/disable state
//! machines.

use crate::ctx::Ctx;
use crate::ctx::CtxInval;
use crate::ppn_phys;
use crate::CoreState;
use crate::RiscvIommu;
use riscv_iommu_spec as spec;
use riscv_iommu_spec::ddt;
use riscv_iommu_spec::CommandCode;
use riscv_iommu_spec::FaultCause;
use riscv_iommu_spec::Register;
use riscv_iommu_spec::TransactionType;

impl RiscvIommu {
    /// Command queue enable/disable transitions, on `CQCSR` writes.
    ///
    /// Enabling latches the ring base and size, zeroes the indices and opens
    /// the tail index bits for the driver; disabling closes them again. Any
    /// other write just clears the busy bit.
    pub(crate) fn process_cq_control(&self, core: &mut CoreState) {
        let ctrl = spec::CqCsr::from(self.reg_get32(Register::CQCSR));
        let busy = spec::CqCsr::new().with_busy(true);

        let (set, clr) = if ctrl.cqen() && !ctrl.cqon() {
            let base = spec::QueueBase::from(self.reg_get64(Register::CQB));
            core.cq.mask = ((2u64 << base.log2sz()) - 1) as u32;
            core.cq.addr = ppn_phys(base.ppn());
            self.reg_set_ro32(Register::CQT, !core.cq.mask);
            self.reg_set32(Register::CQH, 0);
            self.reg_set32(Register::CQT, 0);
            (
                spec::CqCsr::new().with_cqon(true),
                busy.with_cqmf(true)
                    .with_cmd_ill(true)
                    .with_cmd_to(true)
                    .with_fence_w_ip(true),
            )
        } else if !ctrl.cqen() && ctrl.cqon() {
            self.reg_set_ro32(Register::CQT, !0);
            (spec::CqCsr::new(), busy.with_cqon(true))
        } else {
            (spec::CqCsr::new(), busy)
        };
        self.reg_mod32(Register::CQCSR, set.into(), clr.into());
    }

    /// Fault queue enable/disable transitions, on `FQCSR` writes.
    pub(crate) fn process_fq_control(&self, core: &mut CoreState) {
        let ctrl = spec::FqCsr::from(self.reg_get32(Register::FQCSR));
        let busy = spec::FqCsr::new().with_busy(true);

        let (set, clr) = if ctrl.fqen() && !ctrl.fqon() {
            let base = spec::QueueBase::from(self.reg_get64(Register::FQB));
            core.fq.mask = ((2u64 << base.log2sz()) - 1) as u32;
            core.fq.addr = ppn_phys(base.ppn());
            self.reg_set_ro32(Register::FQH, !core.fq.mask);
            self.reg_set32(Register::FQH, 0);
            self.reg_set32(Register::FQT, 0);
            (
                spec::FqCsr::new().with_fqon(true),
                busy.with_fqmf(true).with_fqof(true),
            )
        } else if !ctrl.fqen() && ctrl.fqon() {
            self.reg_set_ro32(Register::FQH, !0);
            (spec::FqCsr::new(), busy.with_fqon(true))
        } else {
            (spec::FqCsr::new(), busy)
        };
        self.reg_mod32(Register::FQCSR, set.into(), clr.into());
    }

    /// Page-request queue enable/disable transitions, on `PQCSR` writes.
    pub(crate) fn process_pq_control(&self, core: &mut CoreState) {
        let ctrl = spec::PqCsr::from(self.reg_get32(Register::PQCSR));
        let busy = spec::PqCsr::new().with_busy(true);

        let (set, clr) = if ctrl.pqen() && !ctrl.pqon() {
            let base = spec::QueueBase::from(self.reg_get64(Register::PQB));
            core.pq.mask = ((2u64 << base.log2sz()) - 1) as u32;
            core.pq.addr = ppn_phys(base.ppn());
            self.reg_set_ro32(Register::PQH, !core.pq.mask);
            self.reg_set32(Register::PQH, 0);
            self.reg_set32(Register::PQT, 0);
            (
                spec::PqCsr::new().with_pqon(true),
                busy.with_pqmf(true).with_pqof(true),
            )
        } else if !ctrl.pqen() && ctrl.pqon() {
            self.reg_set_ro32(Register::PQH, !0);
            (spec::PqCsr::new(), busy.with_pqon(true))
        } else {
            (spec::PqCsr::new(), busy)
        };
        self.reg_mod32(Register::PQCSR, set.into(), clr.into());
    }

    /// Consumes commands after a `CQT` doorbell write, in queue order.
    ///
    /// An illegal command or a queue memory fault latches the matching
    /// status bit and stops processing without advancing the head, so the
    /// failed slot is observable.
    pub(crate) fn process_cq_tail(&self, core: &mut CoreState) {
        let ctrl = spec::CqCsr::from(self.reg_get32(Register::CQCSR));
        if !ctrl.cqon() || ctrl.cmd_ill() || ctrl.cqmf() {
            return;
        }

        let mask = core.cq.mask;
        let tail = self.reg_get32(Register::CQT) & mask;
        let mut head = self.reg_get32(Register::CQH) & mask;
        let mut failed = false;

        while tail != head {
            let addr = core.cq.addr + u64::from(head) * size_of::<spec::Command>() as u64;
            let cmd: spec::Command = match self.target.read_plain(addr) {
                Ok(cmd) => cmd,
                Err(_) => {
                    self.reg_mod32(
                        Register::CQCSR,
                        spec::CqCsr::new().with_cqmf(true).into(),
                        0,
                    );
                    failed = true;
                    break;
                }
            };
            tracing::trace!(dword0 = cmd.dword0, dword1 = cmd.dword1, "command");

            let ill = match cmd.code() {
                CommandCode::IOFENCE_C => {
                    let fence = spec::IofenceCmd::from(cmd.dword0);
                    if self.iofence(&fence, cmd.dword1).is_err() {
                        self.reg_mod32(
                            Register::CQCSR,
                            spec::CqCsr::new().with_cqmf(true).into(),
                            0,
                        );
                        failed = true;
                        break;
                    }
                    false
                }
                CommandCode::IOTINVAL_GVMA => {
                    // GVMA with a process-id selector is illegal; otherwise
                    // nothing to do, address translations are not cached.
                    spec::IotinvalCmd::from(cmd.dword0).pscv()
                }
                CommandCode::IOTINVAL_VMA => false,
                CommandCode::IODIR_INVAL_DDT => {
                    let cmd = spec::IodirCmd::from(cmd.dword0);
                    let sel = if cmd.dv() {
                        CtxInval::Devid(cmd.did())
                    } else {
                        CtxInval::All
                    };
                    self.ctx_invalidate(sel);
                    false
                }
                CommandCode::IODIR_INVAL_PDT => {
                    let cmd = spec::IodirCmd::from(cmd.dword0);
                    if cmd.dv() {
                        self.ctx_invalidate(CtxInval::DevidProcid(cmd.did(), cmd.pid()));
                        false
                    } else {
                        true
                    }
                }
                _ => true,
            };
            if ill {
                self.reg_mod32(
                    Register::CQCSR,
                    spec::CqCsr::new().with_cmd_ill(true).into(),
                    0,
                );
                failed = true;
                break;
            }

            // Advance the head only after the command completes.
            head = (head + 1) & mask;
            self.reg_set32(Register::CQH, head);
        }

        if failed && ctrl.cie() {
            self.notify_intr(spec::INTR_CQ);
        }
    }

    /// `IOFENCE.C`: command processing is synchronous, so the fence itself
    /// has nothing to wait for; only the optional completion write remains.
    fn iofence(&self, fence: &spec::IofenceCmd, addr: u64) -> Result<(), crate::BusError> {
        if !fence.av() {
            return Ok(());
        }
        self.target.write_plain(addr, &fence.data())
    }

    /// Produces a fault record, unless the queue is off or an error is
    /// latched. A full ring latches the overflow bit instead of writing.
    pub(crate) fn fault(&self, ev: spec::FaultRecord) {
        let ctrl = spec::FqCsr::from(self.reg_get32(Register::FQCSR));
        let ring = {
            let core = self.core.lock();
            core.fq
        };
        let head = self.reg_get32(Register::FQH) & ring.mask;
        let tail = self.reg_get32(Register::FQT) & ring.mask;
        let next = (tail + 1) & ring.mask;

        tracing::trace!(
            did = ev.hdr.did(),
            cause = ev.hdr.cause(),
            iotval = ev.iotval,
            "fault"
        );

        if !ctrl.fqon() || ctrl.fqof() || ctrl.fqmf() {
            return;
        }

        if head == next {
            self.reg_mod32(
                Register::FQCSR,
                spec::FqCsr::new().with_fqof(true).into(),
                0,
            );
        } else {
            let addr = ring.addr + u64::from(tail) * size_of::<spec::FaultRecord>() as u64;
            if self.target.write_plain(addr, &ev).is_err() {
                self.reg_mod32(
                    Register::FQCSR,
                    spec::FqCsr::new().with_fqmf(true).into(),
                    0,
                );
            } else {
                self.reg_set32(Register::FQT, next);
            }
        }

        if ctrl.fie() {
            self.notify_intr(spec::INTR_FQ);
        }
    }

    /// Produces a page-request record; symmetric to the fault producer.
    pub(crate) fn pri(&self, pr: spec::PqRecord) {
        let ctrl = spec::PqCsr::from(self.reg_get32(Register::PQCSR));
        let ring = {
            let core = self.core.lock();
            core.pq
        };
        let head = self.reg_get32(Register::PQH) & ring.mask;
        let tail = self.reg_get32(Register::PQT) & ring.mask;
        let next = (tail + 1) & ring.mask;

        tracing::trace!(did = pr.hdr.did(), payload = pr.payload, "page request");

        if !ctrl.pqon() || ctrl.pqof() || ctrl.pqmf() {
            return;
        }

        if head == next {
            self.reg_mod32(
                Register::PQCSR,
                spec::PqCsr::new().with_pqof(true).into(),
                0,
            );
        } else {
            let addr = ring.addr + u64::from(tail) * size_of::<spec::PqRecord>() as u64;
            if self.target.write_plain(addr, &pr).is_err() {
                self.reg_mod32(
                    Register::PQCSR,
                    spec::PqCsr::new().with_pqmf(true).into(),
                    0,
                );
            } else {
                self.reg_set32(Register::PQT, next);
            }
        }

        if ctrl.pie() {
            self.notify_intr(spec::INTR_PQ);
        }
    }

    /// Builds and enqueues a fault record for a failed translation, honoring
    /// the device's fault suppression flag for causes it may suppress.
    pub(crate) fn report_fault(
        &self,
        ctx: &Ctx,
        ttype: TransactionType,
        cause: FaultCause,
        pv: bool,
        iotval: u64,
        iotval2: u64,
    ) {
        if ddt::Tc::from(ctx.tc).dtf() && !always_reported(cause) {
            return;
        }

        let mut hdr = spec::FaultHeader::new()
            .with_cause(cause.0)
            .with_ttype(ttype.0)
            .with_did(ctx.devid)
            .with_pv(true);
        if pv {
            hdr.set_pid(ctx.process_id);
        }

        self.fault(spec::FaultRecord {
            hdr,
            reserved: 0,
            iotval,
            iotval2,
        });
    }
}

/// Causes the device fault suppression flag (`tc.DTF`) cannot suppress.
fn always_reported(cause: FaultCause) -> bool {
    matches!(
        cause,
        FaultCause::DMA_DISABLED
            | FaultCause::DDT_LOAD_FAULT
            | FaultCause::DDT_INVALID
            | FaultCause::DDT_MISCONFIGURED
            | FaultCause::DDT_CORRUPTED
            | FaultCause::INTERNAL_DP_ERROR
            | FaultCause::MSI_WR_FAULT
    )
}
