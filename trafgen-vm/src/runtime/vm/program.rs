use std::fmt;

use super::bytecode::*;
use super::{RANDOM_SEED_OFFSET, RANDOM_SEED_SIZE, run};

/// Packet length bounds of a stream once packet size variation is applied.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PktLenData {
    pub min: u16,
    pub max: u16,
    pub expected: f64,
}

impl PktLenData {
    pub fn fixed(len: u16) -> Self {
        Self {
            min: len,
            max: len,
            expected: len as f64,
        }
    }
}

/// Output of the compiler: the bytecode and the BSS template it runs against.
///
/// A `Program` is immutable once built and is meant to be shared (behind an
/// `Arc`) by every playback instance of the stream on every core. Each
/// instance runs it against its own copy of the BSS obtained from
/// [`Program::new_bss`].
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub bytecode: Box<[u8]>,
    pub bss: Box<[u8]>,
    /// Number of leading packet bytes that must be writable per packet.
    pub prefix_size: u16,
    /// One past the last packet byte any record writes or reads.
    pub max_pkt_offset: u16,
    pub pkt_len: PktLenData,
    pub is_pkt_size_var: bool,
    /// The first 4 BSS bytes hold the seed of the RANDOM variables.
    pub is_random_seed: bool,
}

impl Program {
    pub fn new_bss(&self) -> Box<[u8]> {
        self.bss.clone()
    }

    /// Store the per-instance random seed in a BSS copy. No-op for programs
    /// without RANDOM variables.
    pub fn set_random_seed(&self, bss: &mut [u8], seed: u32) {
        if self.is_random_seed {
            bss[RANDOM_SEED_OFFSET..RANDOM_SEED_OFFSET + RANDOM_SEED_SIZE]
                .copy_from_slice(&seed.to_ne_bytes());
        }
    }

    /// Run the program once. `pkt` must hold at least `prefix_size` bytes.
    #[inline]
    pub fn run(&self, bss: &mut [u8], pkt: &mut [u8]) -> u16 {
        run(bss, &self.bytecode, pkt)
    }

    /// Iterate over `(byte position, opcode)` of every record.
    pub fn records(&self) -> Records<'_> {
        Records {
            bytecode: &self.bytecode,
            pc: 0,
        }
    }
}

pub struct Records<'a> {
    bytecode: &'a [u8],
    pc: usize,
}

impl Iterator for Records<'_> {
    type Item = (usize, OpCode);
    fn next(&mut self) -> Option<Self::Item> {
        let pc = self.pc;
        let op = OpCode::from_u8(*self.bytecode.get(pc)?)?;
        self.pc += op.record_len();
        Some((pc, op))
    }
}

macro_rules! fmt_range {
    ($m:ident, $f:expr, $bc:expr, $pc:expr) => {{
        let r: $m::Range = read_record($bc, $pc);
        let (var, min, max) = (r.var, r.min, r.max);
        write!($f, "bss[{var}] min:{min} max:{max}")
    }};
}
macro_rules! fmt_step {
    ($m:ident, $f:expr, $bc:expr, $pc:expr) => {{
        let r: $m::Step = read_record($bc, $pc);
        let (var, min, max, step) = (r.var, r.min, r.max, r.step);
        write!($f, "bss[{var}] min:{min} max:{max} step:{step}")
    }};
}
macro_rules! fmt_rand_limit {
    ($m:ident, $f:expr, $bc:expr, $pc:expr) => {{
        let r: $m::RandLimit = read_record($bc, $pc);
        let (var, limit, min, max, seed) = (r.var, r.limit, r.min, r.max, r.seed);
        write!($f, "bss[{var}] limit:{limit} min:{min} max:{max} seed:{seed:#x}")
    }};
}
macro_rules! fmt_wr {
    ($m:ident, $f:expr, $bc:expr, $pc:expr) => {{
        let r: $m::Wr = read_record($bc, $pc);
        let (var, off, add, big) = (r.var, r.pkt_offset, r.add, r.flags & FLAG_BIG_ENDIAN != 0);
        write!($f, "bss[{var}] -> pkt[{off}] add:{add} big:{big}")
    }};
}

fn fmt_record(f: &mut fmt::Formatter<'_>, op: OpCode, bc: &[u8], pc: usize) -> fmt::Result {
    use OpCode::*;
    match op {
        Inc8 | Dec8 | Random8 => fmt_range!(b8, f, bc, pc),
        Inc16 | Dec16 | Random16 => fmt_range!(b16, f, bc, pc),
        Inc32 | Dec32 | Random32 => fmt_range!(b32, f, bc, pc),
        Inc64 | Dec64 | Random64 => fmt_range!(b64, f, bc, pc),
        Inc8Step | Dec8Step => fmt_step!(b8, f, bc, pc),
        Inc16Step | Dec16Step => fmt_step!(b16, f, bc, pc),
        Inc32Step | Dec32Step => fmt_step!(b32, f, bc, pc),
        Inc64Step | Dec64Step => fmt_step!(b64, f, bc, pc),
        RandLimit8 => fmt_rand_limit!(b8, f, bc, pc),
        RandLimit16 => fmt_rand_limit!(b16, f, bc, pc),
        RandLimit32 => fmt_rand_limit!(b32, f, bc, pc),
        RandLimit64 => fmt_rand_limit!(b64, f, bc, pc),
        Wr8 => fmt_wr!(b8, f, bc, pc),
        Wr16 => fmt_wr!(b16, f, bc, pc),
        Wr32 => fmt_wr!(b32, f, bc, pc),
        Wr64 => fmt_wr!(b64, f, bc, pc),
        WrMask => {
            let r: WrMaskRec = read_record(bc, pc);
            let (var, off, mask, shift, add) = (r.var, r.pkt_offset, r.mask, r.shift, r.add);
            let (pkt_cast, flowv_cast) = (r.pkt_cast_size, r.flowv_cast_size);
            let big = r.flags & FLAG_BIG_ENDIAN != 0;
            write!(
                f,
                "bss[{var}]/{flowv_cast} -> pkt[{off}]/{pkt_cast} mask:{mask:#x} shift:{shift} add:{add} big:{big}"
            )
        }
        FixIpv4Cs => {
            let r: FixIpv4Rec = read_record(bc, pc);
            let off = r.pkt_offset;
            write!(f, "pkt[{off}]")
        }
        PktSizeChange => {
            let r: PktSizeRec = read_record(bc, pc);
            let var = r.var;
            write!(f, "bss[{var}]")
        }
        ClientVar => {
            let r: ClientRec = read_record(bc, pc);
            let (var, min_ip, max_ip, step_ip) = (r.var, r.min_ip, r.max_ip, r.step_ip);
            let (min_port, max_port, step_port) = (r.min_port, r.max_port, r.step_port);
            let limit = r.limit_flows;
            write!(
                f,
                "bss[{var}] ip:{min_ip:#x}..={max_ip:#x}/{step_ip} port:{min_port}..={max_port}/{step_port} limit:{limit}"
            )
        }
        ClientVarUnlimited => {
            let r: ClientUnlimitedRec = read_record(bc, pc);
            let (var, min_ip, max_ip) = (r.var, r.min_ip, r.max_ip);
            write!(f, "bss[{var}] ip:{min_ip:#x}..={max_ip:#x}")
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "program: {} bytes, bss: {} bytes, prefix: {}, max offset: {}",
            self.bytecode.len(),
            self.bss.len(),
            self.prefix_size,
            self.max_pkt_offset
        )?;
        if self.is_pkt_size_var {
            writeln!(
                f,
                "packet size: {}..={} expected {:.2}",
                self.pkt_len.min, self.pkt_len.max, self.pkt_len.expected
            )?;
        }
        for (pc, op) in self.records() {
            write!(f, "{pc:04} {:<22}", op.mnemonic())?;
            fmt_record(f, op, &self.bytecode, pc)?;
            writeln!(f)?;
        }
        Ok(())
    }
}
