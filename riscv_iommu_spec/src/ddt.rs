// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory data structures walked by the IOMMU: device and process
//! directory tables, device/process contexts, and MSI page-table entries.
//!
//! All structures are little-endian in guest memory.

use bitfield_struct::bitfield;
use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A non-leaf device directory table entry.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DdtEntry {
    pub valid: bool,
    #[bits(9)]
    pub reserved: u16,
    #[bits(44)]
    pub ppn: u64,
    #[bits(10)]
    pub reserved2: u16,
}

impl DdtEntry {
    /// True if any bit outside `valid` and `ppn` is set.
    pub fn reserved_bits_set(&self) -> bool {
        self.reserved() != 0 || self.reserved2() != 0
    }
}

/// A device context, the leaf of the device directory table.
///
/// The extended format is 64 bytes; the base format is the first
/// [`DC_SIZE_BASE`] bytes (no MSI redirection fields).
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DeviceContext {
    pub tc: u64,
    pub iohgatp: u64,
    pub ta: u64,
    pub fsc: u64,
    pub msiptp: u64,
    pub msi_addr_mask: u64,
    pub msi_addr_pattern: u64,
    pub reserved: u64,
}

pub const DC_SIZE_EXT: u64 = 64;
pub const DC_SIZE_BASE: u64 = 32;

/// Translation control field of a device context.
///
/// Bit 32 is reserved for custom extensions; it opts the device into
/// automatic page-request generation for failed ATS probes.
#[bitfield(u64)]
pub struct Tc {
    pub v: bool,
    pub en_ats: bool,
    pub en_pri: bool,
    pub t2gpa: bool,
    pub dtf: bool,
    pub pdtv: bool,
    pub prpr: bool,
    pub gade: bool,
    pub sade: bool,
    pub dpe: bool,
    pub sbe: bool,
    pub sxl: bool,
    #[bits(20)]
    pub reserved: u32,
    pub auto_page_request: bool,
    #[bits(31)]
    pub reserved2: u64,
}

/// MSI page table pointer field of a device context.
#[bitfield(u64)]
pub struct Msiptp {
    #[bits(44)]
    pub ppn: u64,
    #[bits(16)]
    pub reserved: u16,
    #[bits(4)]
    pub mode: u8,
}

#[open_enum]
#[derive(Clone, Copy, Debug, Hash, Ord, PartialOrd)]
#[repr(u8)]
/// MSI page table modes, `msiptp.MODE`.
pub enum MsiptpMode {
    OFF = 0,
    FLAT = 1,
}

/// First-stage context field of a device context, interpreted as the process
/// directory table pointer when `tc.PDTV` is set.
#[bitfield(u64)]
pub struct Pdtp {
    #[bits(44)]
    pub ppn: u64,
    #[bits(16)]
    pub reserved: u16,
    #[bits(4)]
    pub mode: u8,
}

#[open_enum]
#[derive(Clone, Copy, Debug, Hash, Ord, PartialOrd)]
#[repr(u8)]
/// Process directory table modes, `pdtp.MODE`.
pub enum PdtMode {
    BARE = 0,
    PD8 = 1,
    PD17 = 2,
    PD20 = 3,
}

/// A non-leaf process directory table entry.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PdtEntry {
    pub valid: bool,
    #[bits(9)]
    pub reserved: u16,
    #[bits(44)]
    pub ppn: u64,
    #[bits(10)]
    pub reserved2: u16,
}

/// A process context, the leaf of the process directory table.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ProcessContext {
    pub ta: u64,
    pub fsc: u64,
}

pub const PC_SIZE: u64 = 16;

/// Translation attributes field of a process context.
#[bitfield(u64)]
pub struct Pta {
    pub v: bool,
    pub ens: bool,
    pub sum: bool,
    #[bits(9)]
    pub reserved: u16,
    #[bits(20)]
    pub pscid: u32,
    #[bits(32)]
    pub reserved2: u32,
}

/// An MSI page table entry, two 64-bit words.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MsiPte {
    pub pte0: u64,
    pub pte1: u64,
}

/// View of an MSI PTE first word in basic (pass-through) mode.
#[bitfield(u64)]
pub struct MsiPteBasic {
    pub v: bool,
    #[bits(2)]
    pub m: u8,
    #[bits(7)]
    pub reserved: u8,
    #[bits(44)]
    pub ppn: u64,
    #[bits(9)]
    pub reserved2: u16,
    pub c: bool,
}

/// View of an MSI PTE first word in MRIF mode. The `mrif_addr` field holds
/// bits 55:9 of the 512-byte-aligned interrupt file address.
#[bitfield(u64)]
pub struct MsiPteMrif {
    pub v: bool,
    #[bits(2)]
    pub m: u8,
    #[bits(4)]
    pub reserved: u8,
    #[bits(47)]
    pub mrif_addr: u64,
    #[bits(9)]
    pub reserved2: u16,
    pub c: bool,
}

/// View of an MSI PTE second word in MRIF mode, the notice message
/// destination and identity.
#[bitfield(u64)]
pub struct MsiMrifNotice {
    #[bits(10)]
    pub nid: u16,
    #[bits(44)]
    pub nppn: u64,
    #[bits(6)]
    pub reserved: u8,
    pub nid_msb: bool,
    #[bits(3)]
    pub reserved2: u8,
}

pub const MSI_PTE_M_MRIF: u8 = 1;
pub const MSI_PTE_M_BASIC: u8 = 3;
