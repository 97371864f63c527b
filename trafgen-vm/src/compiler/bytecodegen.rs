use std::mem::size_of;

use super::{
    CompileError, Config, ErrorKind, FlowOp, Instruction,
    instruction::{FlowClientVar, FlowVar, FlowVarRandLimit, WriteMaskToPacket, WriteToPacket},
    vartable::VarTable,
};
use crate::runtime::vm::{
    OpCode, PktLenData, Program,
    bytecode::*,
    checksum::{IPV4_HDR_LEN, ipv4_header_len},
    dec_mod, inc_mod, store,
};

/// Writable-prefix allocation classes.
pub const PREFIX_SIZE_CLASSES: [usize; 3] = [64, 128, 512];
/// Packets up to this length are always fully writable.
pub const SMALL_PKT_LEN: usize = 128;
/// A constant suffix shorter than this is not worth sharing.
pub const MIN_CONST_SUFFIX: usize = 64;

/// Number of leading bytes that must live in the per-packet writable buffer
/// when the program touches bytes up to `max_offset` (exclusive).
pub fn calc_prefix_size(max_offset: usize, pkt_len: usize) -> usize {
    if pkt_len <= SMALL_PKT_LEN {
        return pkt_len;
    }
    let class = PREFIX_SIZE_CLASSES
        .iter()
        .copied()
        .find(|c| *c >= max_offset)
        .unwrap_or(max_offset);
    let prefix = class.min(pkt_len);
    if pkt_len - prefix < MIN_CONST_SUFFIX {
        pkt_len
    } else {
        prefix
    }
}

// RANDOM, INC, DEC with unit step share one record layout
macro_rules! emit_range {
    ($m:ident, $self:ident, $op:expr, $var:expr, $min:expr, $max:expr) => {
        push_record(
            &mut $self.bytecode,
            &$m::Range {
                op: $op as u8,
                var: $var,
                min: $min as $m::Value,
                max: $max as $m::Value,
            },
        )
    };
}
macro_rules! emit_step {
    ($m:ident, $self:ident, $op:expr, $var:expr, $min:expr, $max:expr, $step:expr) => {
        push_record(
            &mut $self.bytecode,
            &$m::Step {
                op: $op as u8,
                var: $var,
                min: $min as $m::Value,
                max: $max as $m::Value,
                step: $step as $m::Value,
            },
        )
    };
}
macro_rules! emit_rand_limit {
    ($m:ident, $self:ident, $op:expr, $var:expr, $v:expr) => {
        push_record(
            &mut $self.bytecode,
            &$m::RandLimit {
                op: $op as u8,
                var: $var,
                limit: $v.limit as $m::Value,
                min: $v.min as $m::Value,
                max: $v.max as $m::Value,
                seed: $v.seed,
            },
        )
    };
}
macro_rules! emit_wr {
    ($m:ident, $self:ident, $op:expr, $flags:expr, $var:expr, $offset:expr, $add:expr) => {
        push_record(
            &mut $self.bytecode,
            &$m::Wr {
                op: $op as u8,
                flags: $flags,
                var: $var,
                pkt_offset: $offset,
                add: $add as _,
            },
        )
    };
}

/// Pick the opcode of one of the size-indexed families.
fn sized(size: u8, family: [OpCode; 4]) -> OpCode {
    match size {
        1 => family[0],
        2 => family[1],
        4 => family[2],
        _ => family[3],
    }
}

/// Store `val` truncated to `size` bytes at `offset` of the BSS.
fn store_sized(bss: &mut [u8], offset: usize, size: u8, val: u64) {
    match size {
        1 => store(bss, offset, val as u8),
        2 => store(bss, offset, val as u16),
        4 => store(bss, offset, val as u32),
        _ => store(bss, offset, val),
    }
}

/// Lowers validated instructions into bytecode records and the BSS template.
pub struct ByteCodeGenerator<'a> {
    table: &'a VarTable,
    config: &'a Config,
    pkt_len: usize,
    template: Option<&'a [u8]>,
    bytecode: Vec<u8>,
    bss: Vec<u8>,
    /// One past the furthest packet byte touched, and who touched it.
    max_offset: usize,
    max_offset_instr: usize,
}

impl<'a> ByteCodeGenerator<'a> {
    pub fn new(table: &'a VarTable, config: &'a Config, pkt_len: usize, template: Option<&'a [u8]>) -> Self {
        Self {
            table,
            config,
            pkt_len,
            template,
            bytecode: Vec::new(),
            bss: vec![0; table.bss_size()],
            max_offset: 0,
            max_offset_instr: 0,
        }
    }

    fn touch(&mut self, idx: usize, offset: usize, len: usize) -> Result<(), CompileError> {
        let end = offset + len;
        if end > self.pkt_len {
            return Err(CompileError(
                ErrorKind::PacketOffsetOutOfRange {
                    offset,
                    len,
                    pkt_len: self.pkt_len,
                },
                idx,
            ));
        }
        if end > self.max_offset {
            self.max_offset = end;
            self.max_offset_instr = idx;
        }
        Ok(())
    }

    fn var_offset(&self, name: &str) -> u16 {
        // declarations were validated by the table pass
        self.table.get(name).map(|e| e.offset).unwrap_or_default()
    }

    pub fn emit(&mut self, idx: usize, instr: &Instruction) -> Result<(), CompileError> {
        match instr {
            Instruction::FlowVar(v) => self.emit_flow_var(v),
            Instruction::FlowVarRandLimit(v) => self.emit_rand_limit(v),
            Instruction::FlowClientVar(c) => self.emit_client(c),
            Instruction::WriteToPacket(w) => self.emit_write(idx, w)?,
            Instruction::WriteMaskToPacket(w) => self.emit_write_mask(idx, w)?,
            Instruction::FixChecksumIpv4(c) => {
                let offset = c.pkt_offset as usize;
                self.touch(idx, offset, IPV4_HDR_LEN).map_err(|_| {
                    CompileError(
                        ErrorKind::Ipv4HeaderOutOfRange {
                            offset,
                            hdr_len: IPV4_HDR_LEN,
                            pkt_len: self.pkt_len,
                        },
                        idx,
                    )
                })?;
                if let Some(hdr_len) = self
                    .template
                    .and_then(|pkt| pkt.get(offset))
                    .map(|b| ipv4_header_len(*b))
                {
                    self.touch(idx, offset, hdr_len).map_err(|_| {
                        CompileError(
                            ErrorKind::Ipv4HeaderOutOfRange {
                                offset,
                                hdr_len,
                                pkt_len: self.pkt_len,
                            },
                            idx,
                        )
                    })?;
                }
                push_record(
                    &mut self.bytecode,
                    &FixIpv4Rec {
                        op: OpCode::FixIpv4Cs as u8,
                        pkt_offset: c.pkt_offset,
                    },
                );
            }
            Instruction::ChangePacketSize(c) => {
                let var = self.table.lookup(&c.var_name, idx)?.offset;
                push_record(
                    &mut self.bytecode,
                    &PktSizeRec {
                        op: OpCode::PktSizeChange as u8,
                        var,
                    },
                );
            }
        }
        Ok(())
    }

    fn emit_flow_var(&mut self, v: &FlowVar) {
        use OpCode::*;
        let var = self.var_offset(&v.name);
        let range = v.range();
        let step = if range == 0 { v.step } else { v.step % range };
        let (min, max) = (v.min, v.max);
        let initial = match v.op {
            // stored one step behind so that the first run yields `init`
            FlowOp::Inc => dec_mod(min, max, v.init, step),
            FlowOp::Dec => inc_mod(min, max, v.init, step),
            FlowOp::Random => v.init,
        };
        store_sized(&mut self.bss, var as usize, v.size, initial);

        match (v.op, step == 1) {
            (FlowOp::Random, _) => match sized(v.size, [Random8, Random16, Random32, Random64]) {
                op @ Random8 => emit_range!(b8, self, op, var, min, max),
                op @ Random16 => emit_range!(b16, self, op, var, min, max),
                op @ Random32 => emit_range!(b32, self, op, var, min, max),
                op => emit_range!(b64, self, op, var, min, max),
            },
            (op, true) => {
                let family = if op == FlowOp::Inc {
                    [Inc8, Inc16, Inc32, Inc64]
                } else {
                    [Dec8, Dec16, Dec32, Dec64]
                };
                match v.size {
                    1 => emit_range!(b8, self, sized(1, family), var, min, max),
                    2 => emit_range!(b16, self, sized(2, family), var, min, max),
                    4 => emit_range!(b32, self, sized(4, family), var, min, max),
                    _ => emit_range!(b64, self, sized(8, family), var, min, max),
                }
            }
            (op, false) => {
                let family = if op == FlowOp::Inc {
                    [Inc8Step, Inc16Step, Inc32Step, Inc64Step]
                } else {
                    [Dec8Step, Dec16Step, Dec32Step, Dec64Step]
                };
                match v.size {
                    1 => emit_step!(b8, self, sized(1, family), var, min, max, step),
                    2 => emit_step!(b16, self, sized(2, family), var, min, max, step),
                    4 => emit_step!(b32, self, sized(4, family), var, min, max, step),
                    _ => emit_step!(b64, self, sized(8, family), var, min, max, step),
                }
            }
        }
    }

    fn emit_rand_limit(&mut self, v: &FlowVarRandLimit) {
        use OpCode::*;
        let var = self.var_offset(&v.name);
        let seed_at = var as usize + 2 * v.size as usize;
        store(&mut self.bss, seed_at, v.seed);
        match v.size {
            1 => emit_rand_limit!(b8, self, RandLimit8, var, v),
            2 => emit_rand_limit!(b16, self, RandLimit16, var, v),
            4 => emit_rand_limit!(b32, self, RandLimit32, var, v),
            _ => emit_rand_limit!(b64, self, RandLimit64, var, v),
        }
    }

    fn emit_client(&mut self, c: &FlowClientVar) {
        let var = self.var_offset(&format!("{}.ip", c.name));
        let base = var as usize;
        let (min_ip, max_ip) = (c.ip.min as u64, c.ip.max as u64);
        let init_ip = c.ip.init() as u64;

        if c.unlimited {
            store(&mut self.bss, base + CLIENT_IP_OFFSET, (init_ip as u32).wrapping_sub(1));
            store(&mut self.bss, base + CLIENT_PORT_OFFSET, c.port.min);
            push_record(
                &mut self.bytecode,
                &ClientUnlimitedRec {
                    op: OpCode::ClientVarUnlimited as u8,
                    var,
                    min_ip: c.ip.min,
                    max_ip: c.ip.max,
                },
            );
            return;
        }

        // step back once: the IP steps first and carries into the port on wrap
        let step_ip = c.ip.step as u64;
        let prev_ip = dec_mod(min_ip, max_ip, init_ip, step_ip);
        let wraps = step_ip > init_ip - min_ip;
        let (min_port, max_port) = (c.port.min as u64, c.port.max as u64);
        let mut prev_port = c.port.min as u64;
        if wraps {
            prev_port = dec_mod(min_port, max_port, prev_port, 1);
        }
        prev_port = dec_mod(min_port, max_port, prev_port, c.port.step as u64);
        store(&mut self.bss, base + CLIENT_IP_OFFSET, prev_ip as u32);
        store(&mut self.bss, base + CLIENT_PORT_OFFSET, prev_port as u16);

        push_record(
            &mut self.bytecode,
            &ClientRec {
                op: OpCode::ClientVar as u8,
                flags: if c.flow_limit.is_some() { FLAG_LIMIT_FLOWS } else { 0 },
                var,
                min_port: c.port.min,
                max_port: c.port.max,
                step_port: c.port.step,
                init_port: c.port.min,
                min_ip: c.ip.min,
                max_ip: c.ip.max,
                step_ip: c.ip.step,
                init_ip: init_ip as u32,
                limit_flows: c.flow_limit.unwrap_or(0),
            },
        );
    }

    fn emit_write(&mut self, idx: usize, w: &WriteToPacket) -> Result<(), CompileError> {
        use OpCode::*;
        let entry = self.table.lookup(&w.var_name, idx)?;
        self.touch(idx, w.pkt_offset as usize, entry.size as usize)?;
        let flags = if w.big_endian { FLAG_BIG_ENDIAN } else { 0 };
        let (var, offset, add) = (entry.offset, w.pkt_offset, w.add_value);
        match entry.size {
            1 => emit_wr!(b8, self, Wr8, flags, var, offset, add),
            2 => emit_wr!(b16, self, Wr16, flags, var, offset, add),
            4 => emit_wr!(b32, self, Wr32, flags, var, offset, add),
            _ => emit_wr!(b64, self, Wr64, flags, var, offset, add as i64),
        }
        Ok(())
    }

    fn emit_write_mask(&mut self, idx: usize, w: &WriteMaskToPacket) -> Result<(), CompileError> {
        let entry = self.table.lookup(&w.var_name, idx)?;
        let err = |kind| CompileError(kind, idx);
        if !matches!(w.pkt_cast_size, 1 | 2 | 4) {
            return Err(err(ErrorKind::InvalidCastSize(w.pkt_cast_size)));
        }
        if !(-31..=31).contains(&w.shift) {
            return Err(err(ErrorKind::InvalidShift(w.shift)));
        }
        // 8-byte variables are read through their low 32 bits
        let (flowv_cast_size, var) = if entry.size == 8 {
            let low_half = if cfg!(target_endian = "big") { 4 } else { 0 };
            (4u8, entry.offset + low_half)
        } else {
            (entry.size, entry.offset)
        };
        // the host order path writes with the variable width
        let written = if w.big_endian {
            w.pkt_cast_size
        } else {
            flowv_cast_size
        };
        self.touch(idx, w.pkt_offset as usize, written as usize)?;
        push_record(
            &mut self.bytecode,
            &WrMaskRec {
                op: OpCode::WrMask as u8,
                flags: if w.big_endian { FLAG_BIG_ENDIAN } else { 0 },
                var,
                pkt_offset: w.pkt_offset,
                pkt_cast_size: w.pkt_cast_size,
                flowv_cast_size,
                shift: w.shift,
                mask: w.mask,
                add: w.add_value,
            },
        );
        Ok(())
    }

    pub fn finish(self, pkt_size: Option<PktLenData>) -> Result<Program, CompileError> {
        if self.max_offset > self.config.max_packet_offset_change {
            return Err(CompileError(
                ErrorKind::MaxPacketOffset {
                    offset: self.max_offset,
                    max: self.config.max_packet_offset_change,
                },
                self.max_offset_instr,
            ));
        }
        let prefix_size = calc_prefix_size(self.max_offset, self.pkt_len);
        debug_assert_eq!(self.bss.len(), self.table.bss_size());
        Ok(Program {
            bytecode: self.bytecode.into_boxed_slice(),
            bss: self.bss.into_boxed_slice(),
            prefix_size: prefix_size as u16,
            max_pkt_offset: self.max_offset as u16,
            pkt_len: pkt_size.unwrap_or(PktLenData::fixed(self.pkt_len as u16)),
            is_pkt_size_var: pkt_size.is_some(),
            is_random_seed: self.table.has_random(),
        })
    }
}

const _: () = assert!(size_of::<FixIpv4Rec>() == 3);
