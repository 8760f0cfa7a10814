// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Translation contexts: the device/process directory walk and the bounded
//! context cache.

use crate::ppn_phys;
use crate::RiscvIommu;
use crate::PAGE_OFFSET_MASK;
use parking_lot::Mutex;
use riscv_iommu_spec::ddt;
use riscv_iommu_spec::DdtMode;
use riscv_iommu_spec::Ddtp;
use riscv_iommu_spec::FaultCause;
use riscv_iommu_spec::TransactionType;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Cached contexts are bounded; reaching the limit recycles the whole map.
const CTX_CACHE_LIMIT: usize = 128;

/// A translation context for one `{device_id, process_id}` pair, materialized
/// from a device directory walk.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct Ctx {
    pub devid: u32,
    pub process_id: u32,
    /// Translation control, [`ddt::Tc`].
    pub tc: u64,
    /// Translation attributes, [`ddt::Pta`] once a process context is
    /// loaded.
    pub ta: u64,
    pub msiptp: u64,
    pub msi_addr_mask: u64,
    pub msi_addr_pattern: u64,
}

impl Ctx {
    /// True if `gpa` falls in the MSI address range selected by the context's
    /// mask/pattern filter.
    pub fn msi_check(&self, gpa: u64) -> bool {
        if ddt::MsiptpMode(ddt::Msiptp::from(self.msiptp).mode()) != ddt::MsiptpMode::FLAT {
            return false;
        }
        (crate::ppn_down(gpa) ^ self.msi_addr_pattern) & !self.msi_addr_mask == 0
    }
}

/// A cached context. The validity bit lives in an atomic so invalidation
/// commands can clear it in place while translations hold a reference.
pub(crate) struct CtxEntry {
    devid: u32,
    process_id: u32,
    tc: AtomicU64,
    ta: u64,
    msiptp: u64,
    msi_addr_mask: u64,
    msi_addr_pattern: u64,
}

impl CtxEntry {
    fn new(ctx: &Ctx) -> Self {
        Self {
            devid: ctx.devid,
            process_id: ctx.process_id,
            tc: AtomicU64::new(ctx.tc),
            ta: ctx.ta,
            msiptp: ctx.msiptp,
            msi_addr_mask: ctx.msi_addr_mask,
            msi_addr_pattern: ctx.msi_addr_pattern,
        }
    }

    fn valid(&self) -> bool {
        ddt::Tc::from(self.tc.load(Ordering::Acquire)).v()
    }

    fn invalidate(&self) {
        self.tc
            .fetch_and(!u64::from(ddt::Tc::new().with_v(true)), Ordering::Release);
    }

    /// A consistent copy for use across one translation.
    pub fn snapshot(&self) -> Ctx {
        Ctx {
            devid: self.devid,
            process_id: self.process_id,
            tc: self.tc.load(Ordering::Acquire),
            ta: self.ta,
            msiptp: self.msiptp,
            msi_addr_mask: self.msi_addr_mask,
            msi_addr_pattern: self.msi_addr_pattern,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
struct CtxKey {
    devid: u32,
    process_id: u32,
}

/// Selects which cached contexts an invalidation command applies to.
#[derive(Debug, Copy, Clone)]
pub(crate) enum CtxInval {
    All,
    Devid(u32),
    DevidProcid(u32, u32),
}

/// Cache of materialized translation contexts.
///
/// Lookups return a reference-counted entry, so a translation in flight keeps
/// its context alive across the overflow recycle below. Invalidation clears
/// the validity bit in place; the entry itself is only discarded when the map
/// is recycled.
pub(crate) struct CtxCache {
    map: Mutex<HashMap<CtxKey, Arc<CtxEntry>>>,
}

impl CtxCache {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, devid: u32, process_id: u32) -> Option<Arc<CtxEntry>> {
        let map = self.map.lock();
        let entry = map.get(&CtxKey { devid, process_id })?;
        entry.valid().then(|| entry.clone())
    }

    fn insert(&self, ctx: &Ctx) -> Arc<CtxEntry> {
        let entry = Arc::new(CtxEntry::new(ctx));
        let mut map = self.map.lock();
        if map.len() >= CTX_CACHE_LIMIT {
            // Recycle: replace the map wholesale. Outstanding references keep
            // their entries alive until dropped.
            *map = HashMap::new();
        }
        map.insert(
            CtxKey {
                devid: ctx.devid,
                process_id: ctx.process_id,
            },
            entry.clone(),
        );
        entry
    }

    pub fn invalidate(&self, sel: CtxInval) {
        let map = self.map.lock();
        for entry in map.values() {
            let hit = match sel {
                CtxInval::All => true,
                CtxInval::Devid(devid) => entry.devid == devid,
                CtxInval::DevidProcid(devid, process_id) => {
                    entry.devid == devid && entry.process_id == process_id
                }
            };
            if hit {
                entry.invalidate();
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }
}

impl RiscvIommu {
    /// Finds or materializes the translation context for
    /// `{devid, process_id}`. A failed directory walk is reported to the
    /// fault queue and returned as the walk's cause.
    pub(crate) fn ctx(
        &self,
        devid: u32,
        process_id: u32,
    ) -> Result<Arc<CtxEntry>, FaultCause> {
        if let Some(entry) = self.cache.get(devid, process_id) {
            return Ok(entry);
        }

        let mut ctx = Ctx {
            devid,
            process_id,
            ..Default::default()
        };
        match self.ctx_fetch(&mut ctx) {
            Ok(()) => Ok(self.cache.insert(&ctx)),
            Err(cause) => {
                self.report_fault(
                    &ctx,
                    TransactionType::UADDR_RD,
                    cause,
                    process_id != 0,
                    0,
                    0,
                );
                Err(cause)
            }
        }
    }

    pub(crate) fn ctx_invalidate(&self, sel: CtxInval) {
        tracing::debug!(?sel, "context invalidate");
        self.cache.invalidate(sel);
    }

    /// Walks the device directory tree, then the process directory tree when
    /// the device context enables it, populating `ctx`.
    fn ctx_fetch(&self, ctx: &mut Ctx) -> Result<(), FaultCause> {
        let ddtp = Ddtp::from(self.core.lock().ddtp);
        let mut addr = ppn_phys(ddtp.ppn());
        // Device context format: base (32 bytes) without MSI redirection
        // fields, extended (64 bytes) with them.
        let base_fmt = !self.enable_msi;
        let dc_len = if base_fmt {
            ddt::DC_SIZE_BASE
        } else {
            ddt::DC_SIZE_EXT
        };

        let mut depth: u32 = match DdtMode(ddtp.mode()) {
            DdtMode::OFF => return Err(FaultCause::DMA_DISABLED),
            DdtMode::BARE => {
                // Mock up a pass-through translation context.
                ctx.tc = ddt::Tc::new().with_v(true).into();
                ctx.ta = 0;
                ctx.msiptp = 0;
                return Ok(());
            }
            DdtMode::ONE_LVL => 0,
            DdtMode::TWO_LVL => 1,
            DdtMode::THREE_LVL => 2,
            _ => return Err(FaultCause::DDT_MISCONFIGURED),
        };

        // Check the supported device id width in bits: the base format
        // carries one more index bit per non-leaf level.
        let extra = u32::from(base_fmt && depth != 2);
        if ctx.devid >= 1 << (depth * 9 + 6 + extra) {
            return Err(FaultCause::TTYPE_BLOCKED);
        }

        // Non-leaf directory levels, high index bits first.
        while depth > 0 {
            depth -= 1;
            let split = depth * 9 + 6 + u32::from(base_fmt);
            let ea = addr | ((u64::from(ctx.devid >> split) << 3) & PAGE_OFFSET_MASK);
            let de = ddt::DdtEntry::from(
                self.target
                    .read_plain::<u64>(ea)
                    .map_err(|_| FaultCause::DDT_LOAD_FAULT)?,
            );
            if !de.valid() {
                return Err(FaultCause::DDT_INVALID);
            }
            if de.reserved_bits_set() {
                return Err(FaultCause::DDT_MISCONFIGURED);
            }
            addr = ppn_phys(de.ppn());
        }

        // Leaf: the device context record.
        let addr = addr | ((u64::from(ctx.devid) * dc_len) & PAGE_OFFSET_MASK);
        let mut dc = ddt::DeviceContext::new_zeroed();
        self.target
            .read(addr, &mut dc.as_mut_bytes()[..dc_len as usize])
            .map_err(|_| FaultCause::DDT_LOAD_FAULT)?;

        ctx.tc = dc.tc;
        ctx.ta = dc.ta;
        ctx.msiptp = dc.msiptp;
        ctx.msi_addr_mask = dc.msi_addr_mask;
        ctx.msi_addr_pattern = dc.msi_addr_pattern;

        let tc = ddt::Tc::from(ctx.tc);
        if !tc.v() {
            return Err(FaultCause::DDT_INVALID);
        }
        if !self.validate_device_ctx(ctx) {
            return Err(FaultCause::DDT_MISCONFIGURED);
        }

        if !tc.pdtv() {
            if ctx.process_id != 0 {
                // Process ids are disabled for this device.
                return Err(FaultCause::TTYPE_BLOCKED);
            }
            return Ok(());
        }

        // Process directory walk.
        let pdtp = ddt::Pdtp::from(dc.fsc);
        let mut depth: u32 = match ddt::PdtMode(pdtp.mode()) {
            ddt::PdtMode::BARE => return Ok(()),
            ddt::PdtMode::PD8 => 0,
            ddt::PdtMode::PD17 => 1,
            ddt::PdtMode::PD20 => 2,
            _ => return Err(FaultCause::PDT_MISCONFIGURED),
        };
        let mut addr = ppn_phys(pdtp.ppn());

        while depth > 0 {
            depth -= 1;
            let split = depth * 9 + 8;
            let ea = addr | ((u64::from(ctx.process_id >> split) << 3) & PAGE_OFFSET_MASK);
            let de = ddt::PdtEntry::from(
                self.target
                    .read_plain::<u64>(ea)
                    .map_err(|_| FaultCause::PDT_LOAD_FAULT)?,
            );
            if !de.valid() {
                return Err(FaultCause::PDT_INVALID);
            }
            addr = ppn_phys(de.ppn());
        }

        // Leaf: the process context; its TA replaces the device context's.
        let addr = addr | ((u64::from(ctx.process_id) << 4) & PAGE_OFFSET_MASK);
        let pc: ddt::ProcessContext = self
            .target
            .read_plain(addr)
            .map_err(|_| FaultCause::PDT_LOAD_FAULT)?;
        ctx.ta = pc.ta;

        let ta = ddt::Pta::from(ctx.ta);
        if !ta.v() {
            return Err(FaultCause::PDT_INVALID);
        }
        if ta.reserved() != 0 || ta.reserved2() != 0 {
            return Err(FaultCause::PDT_MISCONFIGURED);
        }
        Ok(())
    }

    /// Device-context configuration checks.
    fn validate_device_ctx(&self, ctx: &Ctx) -> bool {
        let tc = ddt::Tc::from(ctx.tc);
        if !tc.en_pri() && tc.prpr() {
            return false;
        }
        if !self.cap.t2gpa() && tc.t2gpa() {
            return false;
        }
        if self.cap.msi_flat() {
            let mode = ddt::MsiptpMode(ddt::Msiptp::from(ctx.msiptp).mode());
            if mode != ddt::MsiptpMode::OFF && mode != ddt::MsiptpMode::FLAT {
                return false;
            }
        }
        // Only little-endian accesses are supported.
        if tc.sbe() {
            return false;
        }
        true
    }
}
