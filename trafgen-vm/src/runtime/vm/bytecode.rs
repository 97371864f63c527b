//! Opcode tags and the fixed record layouts of the bytecode.
//!
//! A program is a concatenation of records. Each record starts with its
//! one-byte opcode and its length is a function of that byte alone, so the
//! interpreter never needs a length prefix. Multi-byte fields are stored in
//! host byte order, as is the BSS.

use std::mem::size_of;

use bytemuck::{Pod, Zeroable};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Inc8 = 7,
    Inc16,
    Inc32,
    Inc64,
    Dec8,
    Dec16,
    Dec32,
    Dec64,
    Random8,
    Random16,
    Random32,
    Random64,
    FixIpv4Cs,
    Wr8,
    Wr16,
    Wr32,
    Wr64,
    ClientVar,
    ClientVarUnlimited,
    PktSizeChange,
    Inc8Step,
    Inc16Step,
    Inc32Step,
    Inc64Step,
    Dec8Step,
    Dec16Step,
    Dec32Step,
    Dec64Step,
    WrMask,
    RandLimit8,
    RandLimit16,
    RandLimit32,
    RandLimit64,
}

impl OpCode {
    const ALL: [OpCode; 33] = {
        use OpCode::*;
        [
            Inc8, Inc16, Inc32, Inc64, Dec8, Dec16, Dec32, Dec64, Random8, Random16, Random32,
            Random64, FixIpv4Cs, Wr8, Wr16, Wr32, Wr64, ClientVar, ClientVarUnlimited,
            PktSizeChange, Inc8Step, Inc16Step, Inc32Step, Inc64Step, Dec8Step, Dec16Step,
            Dec32Step, Dec64Step, WrMask, RandLimit8, RandLimit16, RandLimit32, RandLimit64,
        ]
    };

    pub fn from_u8(byte: u8) -> Option<Self> {
        let first = OpCode::Inc8 as u8;
        byte.checked_sub(first)
            .and_then(|i| Self::ALL.get(i as usize))
            .copied()
    }

    /// Length in bytes of a record carrying this opcode.
    pub fn record_len(self) -> usize {
        use OpCode::*;
        match self {
            Inc8 | Dec8 | Random8 => size_of::<b8::Range>(),
            Inc16 | Dec16 | Random16 => size_of::<b16::Range>(),
            Inc32 | Dec32 | Random32 => size_of::<b32::Range>(),
            Inc64 | Dec64 | Random64 => size_of::<b64::Range>(),
            Inc8Step | Dec8Step => size_of::<b8::Step>(),
            Inc16Step | Dec16Step => size_of::<b16::Step>(),
            Inc32Step | Dec32Step => size_of::<b32::Step>(),
            Inc64Step | Dec64Step => size_of::<b64::Step>(),
            RandLimit8 => size_of::<b8::RandLimit>(),
            RandLimit16 => size_of::<b16::RandLimit>(),
            RandLimit32 => size_of::<b32::RandLimit>(),
            RandLimit64 => size_of::<b64::RandLimit>(),
            Wr8 => size_of::<b8::Wr>(),
            Wr16 => size_of::<b16::Wr>(),
            Wr32 => size_of::<b32::Wr>(),
            Wr64 => size_of::<b64::Wr>(),
            WrMask => size_of::<WrMaskRec>(),
            FixIpv4Cs => size_of::<FixIpv4Rec>(),
            PktSizeChange => size_of::<PktSizeRec>(),
            ClientVar => size_of::<ClientRec>(),
            ClientVarUnlimited => size_of::<ClientUnlimitedRec>(),
        }
    }

    pub fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            Inc8 => "inc8",
            Inc16 => "inc16",
            Inc32 => "inc32",
            Inc64 => "inc64",
            Dec8 => "dec8",
            Dec16 => "dec16",
            Dec32 => "dec32",
            Dec64 => "dec64",
            Random8 => "random8",
            Random16 => "random16",
            Random32 => "random32",
            Random64 => "random64",
            FixIpv4Cs => "fix_ipv4_cs",
            Wr8 => "wr8",
            Wr16 => "wr16",
            Wr32 => "wr32",
            Wr64 => "wr64",
            ClientVar => "client_var",
            ClientVarUnlimited => "client_var_unlimited",
            PktSizeChange => "pkt_size_change",
            Inc8Step => "inc8_step",
            Inc16Step => "inc16_step",
            Inc32Step => "inc32_step",
            Inc64Step => "inc64_step",
            Dec8Step => "dec8_step",
            Dec16Step => "dec16_step",
            Dec32Step => "dec32_step",
            Dec64Step => "dec64_step",
            WrMask => "wr_mask",
            RandLimit8 => "rand_limit8",
            RandLimit16 => "rand_limit16",
            RandLimit32 => "rand_limit32",
            RandLimit64 => "rand_limit64",
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Set in the `flags` byte of write records when the packet field is big endian.
pub const FLAG_BIG_ENDIAN: u8 = 0x1;
/// Set in the `flags` byte of client records when the flow counter is active.
pub const FLAG_LIMIT_FLOWS: u8 = 0x1;

/// Records whose layout depends on the flow variable width.
macro_rules! sized_records {
    ($($modname:ident : $t:ty, $add:ty);* $(;)?) => {
        $(
        pub mod $modname {
            use bytemuck::{Pod, Zeroable};

            pub type Value = $t;

            /// INC / DEC with unit step, RANDOM.
            #[repr(C, packed)]
            #[derive(Clone, Copy, Pod, Zeroable)]
            pub struct Range {
                pub op: u8,
                pub var: u16,
                pub min: $t,
                pub max: $t,
            }

            /// INC / DEC with an explicit step.
            #[repr(C, packed)]
            #[derive(Clone, Copy, Pod, Zeroable)]
            pub struct Step {
                pub op: u8,
                pub var: u16,
                pub min: $t,
                pub max: $t,
                pub step: $t,
            }

            #[repr(C, packed)]
            #[derive(Clone, Copy, Pod, Zeroable)]
            pub struct RandLimit {
                pub op: u8,
                pub var: u16,
                pub limit: $t,
                pub min: $t,
                pub max: $t,
                pub seed: u32,
            }

            #[repr(C, packed)]
            #[derive(Clone, Copy, Pod, Zeroable)]
            pub struct Wr {
                pub op: u8,
                pub flags: u8,
                pub var: u16,
                pub pkt_offset: u16,
                pub add: $add,
            }
        }
        )*
    };
}

sized_records! {
    b8: u8, i8;
    b16: u16, i16;
    b32: u32, i32;
    b64: u64, i64;
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct WrMaskRec {
    pub op: u8,
    pub flags: u8,
    pub var: u16,
    pub pkt_offset: u16,
    pub pkt_cast_size: u8,
    pub flowv_cast_size: u8,
    pub shift: i8,
    pub mask: u32,
    pub add: i32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct FixIpv4Rec {
    pub op: u8,
    pub pkt_offset: u16,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct PktSizeRec {
    pub op: u8,
    pub var: u16,
}

/// Bounded client generator. The BSS block at `var` is `ip: u32, port: u16,
/// flow_id: u32`.
#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct ClientRec {
    pub op: u8,
    pub flags: u8,
    pub var: u16,
    pub min_port: u16,
    pub max_port: u16,
    pub step_port: u16,
    pub init_port: u16,
    pub min_ip: u32,
    pub max_ip: u32,
    pub step_ip: u32,
    pub init_ip: u32,
    pub limit_flows: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct ClientUnlimitedRec {
    pub op: u8,
    pub var: u16,
    pub min_ip: u32,
    pub max_ip: u32,
}

const _: () = assert!(size_of::<b8::Range>() == 5);
const _: () = assert!(size_of::<b64::Step>() == 27);
const _: () = assert!(size_of::<b16::RandLimit>() == 13);
const _: () = assert!(size_of::<b32::Wr>() == 10);
const _: () = assert!(size_of::<WrMaskRec>() == 17);
const _: () = assert!(size_of::<ClientRec>() == 32);
const _: () = assert!(size_of::<ClientUnlimitedRec>() == 11);

/// Offsets of the client block fields relative to its BSS base.
pub const CLIENT_IP_OFFSET: usize = 0;
pub const CLIENT_PORT_OFFSET: usize = 4;
pub const CLIENT_FLOW_ID_OFFSET: usize = 6;
pub const CLIENT_BSS_SIZE: usize = 10;

/// Read a record of type `T` starting at `pc`.
#[inline]
pub fn read_record<T: Pod>(program: &[u8], pc: usize) -> T {
    bytemuck::pod_read_unaligned(&program[pc..pc + size_of::<T>()])
}

/// Append a record to a program under construction.
pub fn push_record<T: Pod>(program: &mut Vec<u8>, rec: &T) {
    program.extend_from_slice(bytemuck::bytes_of(rec));
}
