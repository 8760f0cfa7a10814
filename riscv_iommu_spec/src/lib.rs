// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions from the RISC-V IOMMU Architecture Specification:
//!
//! <https://github.com/riscv-non-isa/riscv-iommu>
//!
//! Covers the memory-mapped register file, the command/fault/page-request
//! queue record formats, and the fault cause encodings. The in-memory
//! directory and MSI page-table structures live in [`ddt`].

#![no_std]

pub mod ddt;

use bitfield_struct::bitfield;
use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[open_enum]
#[derive(Clone, Copy, Debug, Hash, Ord, PartialOrd)]
#[repr(u16)]
pub enum Register {
    CAP = 0x0,
    FCTL = 0x8,
    DDTP = 0x10,
    CQB = 0x18,
    CQH = 0x20,
    CQT = 0x24,
    FQB = 0x28,
    FQH = 0x30,
    FQT = 0x34,
    PQB = 0x38,
    PQH = 0x40,
    PQT = 0x44,
    CQCSR = 0x48,
    FQCSR = 0x4c,
    PQCSR = 0x50,
    IPSR = 0x54,
    IVEC = 0x2f8,
    MSI_CONFIG = 0x300,
}

/// Size of the directly-managed register window. Accesses at or beyond the
/// MSI configuration area are handled elsewhere.
pub const REG_SIZE: usize = Register::MSI_CONFIG.0 as usize;

#[bitfield(u64)]
pub struct Capabilities {
    pub version: u8,
    #[bits(14)]
    pub reserved: u16,
    pub msi_flat: bool,
    pub msi_mrif: bool,
    #[bits(1)]
    pub reserved2: u8,
    pub ats: bool,
    pub t2gpa: bool,
    #[bits(5)]
    pub reserved3: u8,
    #[bits(6)]
    pub pas: u8,
    pub pd8: bool,
    pub pd17: bool,
    pub pd20: bool,
    #[bits(23)]
    pub reserved4: u32,
}

#[bitfield(u32)]
pub struct Fctl {
    pub be: bool,
    pub wsi: bool,
    pub gxl: bool,
    #[bits(29)]
    pub reserved: u32,
}

#[bitfield(u64)]
pub struct Ddtp {
    #[bits(4)]
    pub mode: u8,
    pub busy: bool,
    #[bits(5)]
    pub reserved: u8,
    #[bits(44)]
    pub ppn: u64,
    #[bits(10)]
    pub reserved2: u16,
}

#[open_enum]
#[derive(Clone, Copy, Debug, Hash, Ord, PartialOrd)]
#[repr(u8)]
/// Device directory table modes, `DDTP.MODE`.
pub enum DdtMode {
    OFF = 0,
    BARE = 1,
    ONE_LVL = 2,
    TWO_LVL = 3,
    THREE_LVL = 4,
}

/// Queue base register layout, shared by `CQB`, `FQB` and `PQB`. The queue
/// holds `2^(log2sz + 1)` entries.
#[bitfield(u64)]
pub struct QueueBase {
    #[bits(5)]
    pub log2sz: u8,
    #[bits(5)]
    pub reserved: u8,
    #[bits(44)]
    pub ppn: u64,
    #[bits(10)]
    pub reserved2: u16,
}

#[bitfield(u32)]
pub struct CqCsr {
    pub cqen: bool,
    pub cie: bool,
    #[bits(6)]
    pub reserved: u8,
    pub cqmf: bool,
    pub cmd_to: bool,
    pub cmd_ill: bool,
    pub fence_w_ip: bool,
    #[bits(4)]
    pub reserved2: u8,
    pub cqon: bool,
    pub busy: bool,
    #[bits(14)]
    pub reserved3: u16,
}

#[bitfield(u32)]
pub struct FqCsr {
    pub fqen: bool,
    pub fie: bool,
    #[bits(6)]
    pub reserved: u8,
    pub fqmf: bool,
    pub fqof: bool,
    #[bits(6)]
    pub reserved2: u8,
    pub fqon: bool,
    pub busy: bool,
    #[bits(14)]
    pub reserved3: u16,
}

#[bitfield(u32)]
pub struct PqCsr {
    pub pqen: bool,
    pub pie: bool,
    #[bits(6)]
    pub reserved: u8,
    pub pqmf: bool,
    pub pqof: bool,
    #[bits(6)]
    pub reserved2: u8,
    pub pqon: bool,
    pub busy: bool,
    #[bits(14)]
    pub reserved3: u16,
}

#[bitfield(u32)]
pub struct Ipsr {
    pub cip: bool,
    pub fip: bool,
    pub pmip: bool,
    pub pip: bool,
    #[bits(28)]
    pub reserved: u32,
}

/// Interrupt vector map, one 4-bit vector per interrupt source.
#[bitfield(u64)]
pub struct Ivec {
    #[bits(4)]
    pub civ: u8,
    #[bits(4)]
    pub fiv: u8,
    #[bits(4)]
    pub pmiv: u8,
    #[bits(4)]
    pub piv: u8,
    #[bits(48)]
    pub reserved: u64,
}

/// Interrupt source indices, used to index [`Ipsr`] bits and [`Ivec`] nibbles.
pub const INTR_CQ: u32 = 0;
pub const INTR_FQ: u32 = 1;
pub const INTR_PM: u32 = 2;
pub const INTR_PQ: u32 = 3;

/// A command queue entry.
///
/// The opcode and function code live in the low ten bits of `dword0`; the
/// remaining operand layout depends on the command and is exposed through the
/// per-command bitfield views below.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Command {
    pub dword0: u64,
    pub dword1: u64,
}

impl Command {
    /// The combined `func << 7 | opcode` discriminator.
    pub fn code(&self) -> CommandCode {
        CommandCode((self.dword0 & 0x3ff) as u16)
    }
}

#[open_enum]
#[derive(Clone, Copy, Debug, Hash, Ord, PartialOrd)]
#[repr(u16)]
/// Combined `func << 7 | opcode` command codes.
pub enum CommandCode {
    IOTINVAL_VMA = 0x001,
    IOFENCE_C = 0x002,
    IODIR_INVAL_DDT = 0x003,
    IOTINVAL_GVMA = 0x081,
    IODIR_INVAL_PDT = 0x083,
}

pub const CMD_OPCODE_IOTINVAL: u8 = 1;
pub const CMD_OPCODE_IOFENCE: u8 = 2;
pub const CMD_OPCODE_IODIR: u8 = 3;

/// `IOFENCE` operand layout for `dword0`. The completion address is carried
/// in `dword1`.
#[bitfield(u64)]
pub struct IofenceCmd {
    #[bits(7)]
    pub opcode: u8,
    #[bits(3)]
    pub func: u8,
    pub av: bool,
    pub wsi: bool,
    pub pr: bool,
    pub pw: bool,
    #[bits(18)]
    pub reserved: u32,
    pub data: u32,
}

/// `IOTINVAL` operand layout for `dword0`.
#[bitfield(u64)]
pub struct IotinvalCmd {
    #[bits(7)]
    pub opcode: u8,
    #[bits(3)]
    pub func: u8,
    pub av: bool,
    #[bits(1)]
    pub reserved: u8,
    #[bits(20)]
    pub pscid: u32,
    pub pscv: bool,
    pub gv: bool,
    #[bits(10)]
    pub reserved2: u16,
    pub gscid: u16,
    #[bits(4)]
    pub reserved3: u8,
}

/// `IODIR` operand layout for `dword0`.
#[bitfield(u64)]
pub struct IodirCmd {
    #[bits(7)]
    pub opcode: u8,
    #[bits(3)]
    pub func: u8,
    #[bits(2)]
    pub reserved: u8,
    #[bits(20)]
    pub pid: u32,
    #[bits(1)]
    pub reserved2: u8,
    pub dv: bool,
    #[bits(6)]
    pub reserved3: u8,
    #[bits(24)]
    pub did: u32,
}

/// Fault queue record header.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FaultHeader {
    #[bits(12)]
    pub cause: u16,
    #[bits(20)]
    pub pid: u32,
    pub pv: bool,
    pub privileged: bool,
    #[bits(6)]
    pub ttype: u8,
    #[bits(24)]
    pub did: u32,
}

/// A fault queue record.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FaultRecord {
    pub hdr: FaultHeader,
    pub reserved: u64,
    pub iotval: u64,
    pub iotval2: u64,
}

/// Page-request queue record header.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PqHeader {
    #[bits(12)]
    pub reserved: u16,
    #[bits(20)]
    pub pid: u32,
    pub pv: bool,
    pub privileged: bool,
    pub exec: bool,
    #[bits(5)]
    pub reserved2: u8,
    #[bits(24)]
    pub did: u32,
}

/// A page-request queue record. The payload carries the page-aligned address
/// and the low request flag bits.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PqRecord {
    pub hdr: PqHeader,
    pub payload: u64,
}

pub const PQ_PAYLOAD_R: u64 = 1 << 0;
pub const PQ_PAYLOAD_W: u64 = 1 << 1;
pub const PQ_PAYLOAD_L: u64 = 1 << 2;
/// Message flag group, all of R/W/L set.
pub const PQ_PAYLOAD_M: u64 = PQ_PAYLOAD_R | PQ_PAYLOAD_W | PQ_PAYLOAD_L;

#[open_enum]
#[derive(Clone, Copy, Debug, Hash, Ord, PartialOrd)]
#[repr(u16)]
/// Fault record cause encodings.
pub enum FaultCause {
    DMA_DISABLED = 256,
    DDT_LOAD_FAULT = 257,
    DDT_INVALID = 258,
    DDT_MISCONFIGURED = 259,
    TTYPE_BLOCKED = 260,
    MSI_LOAD_FAULT = 261,
    MSI_INVALID = 262,
    MSI_MISCONFIGURED = 263,
    MRIF_FAULT = 264,
    PDT_LOAD_FAULT = 265,
    PDT_INVALID = 266,
    PDT_MISCONFIGURED = 267,
    DDT_CORRUPTED = 268,
    PDT_CORRUPTED = 269,
    MSI_PT_CORRUPTED = 270,
    MRIF_CORRUPTED = 271,
    INTERNAL_DP_ERROR = 272,
    MSI_WR_FAULT = 273,
}

#[open_enum]
#[derive(Clone, Copy, Debug, Hash, Ord, PartialOrd)]
#[repr(u8)]
/// Fault record transaction types.
pub enum TransactionType {
    NONE = 0,
    UADDR_INST_FETCH = 1,
    UADDR_RD = 2,
    UADDR_WR = 3,
    TADDR_INST_FETCH = 5,
    TADDR_RD = 6,
    TADDR_WR = 7,
    ATS_MSG_REQ = 8,
}
