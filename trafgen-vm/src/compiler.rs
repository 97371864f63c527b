pub mod bytecodegen;
pub mod fastrand_avg;
pub mod instruction;
pub mod streamvm;
pub mod vartable;

pub use fastrand_avg::FastRandAvgCache;
pub use instruction::*;
pub use streamvm::StreamVm;

use thiserror::Error;

use crate::{
    runtime::vm::{PktLenData, Program},
    utils::error::ReportableError,
};
use bytecodegen::ByteCodeGenerator;
use vartable::{VarKind, VarTable};

/// Largest BSS a single stream may use, in bytes.
pub const MAX_FLOW_VAR: usize = 64;
/// Packet bytes past this offset can never be touched by a program.
pub const MAX_PACKET_OFFSET_CHANGE: usize = 512;
/// Smallest Ethernet frame a packet size variable may produce.
pub const MIN_PKT_SIZE: u16 = 60;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    #[error("variable size {0} is not valid, must be 1, 2, 4 or 8")]
    InvalidSize(u8),
    #[error("variable '{0}' is declared more than once")]
    DuplicateVariable(String),
    #[error("variable '{0}' is not declared")]
    UnknownVariable(String),
    #[error("variable '{0}' is used before its declaration")]
    UseBeforeDeclaration(String),
    #[error("min value {min} must be smaller than max value {max}")]
    InvalidRange { min: u64, max: u64 },
    #[error("init value {init} is outside of [{min}, {max}]")]
    InitOutOfRange { init: u64, min: u64, max: u64 },
    #[error("value {value} does not fit in a variable of {size} byte(s)")]
    ValueTooWide { value: u64, size: u8 },
    #[error("step {step} is not valid for a range of {range} value(s)")]
    InvalidStep { step: u64, range: u64 },
    #[error("limit {limit} is not valid, must be between 1 and {max}")]
    InvalidLimit { limit: u64, max: u64 },
    #[error("flow variables need {size} bytes, the maximum is {max}")]
    BssOverflow { size: usize, max: usize },
    #[error("writing {len} byte(s) at offset {offset} exceeds the packet size {pkt_len}")]
    PacketOffsetOutOfRange { offset: usize, len: usize, pkt_len: usize },
    #[error("packet offset {offset} is beyond the writable limit of {max} bytes")]
    MaxPacketOffset { offset: usize, max: usize },
    #[error("packet cast size {0} is not valid, must be 1, 2 or 4")]
    InvalidCastSize(u8),
    #[error("shift {0} is not valid, must be between -31 and 31")]
    InvalidShift(i8),
    #[error("IPv4 header of {hdr_len} bytes at offset {offset} exceeds the packet size {pkt_len}")]
    Ipv4HeaderOutOfRange {
        offset: usize,
        hdr_len: usize,
        pkt_len: usize,
    },
    #[error("packet size change should point to a flow variable of size 2, '{name}' has size {size}")]
    PacketSizeVarWidth { name: String, size: u8 },
    #[error("packet size change should point to a plain flow variable, '{0}' is a random limit or client variable")]
    PacketSizeVarKind(String),
    #[error("packet size change is used more than once")]
    MultiplePacketSizeChange,
    #[error("packet of {pkt_len} bytes is too small for a packet size change, the minimum is {min}")]
    PacketTooSmall { pkt_len: usize, min: u16 },
    #[error("packet of {0} bytes is too large")]
    PacketTooLarge(usize),
    #[error("min packet size {min} is bigger or equal to max packet size {max}")]
    InvalidPacketSizeRange { min: u64, max: u64 },
    #[error("a stream program needs at least one variable or client generator")]
    NoVariable,
}

/// A compile failure and the index of the instruction it is attributed to.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("instruction id '{1}': {0}")]
pub struct CompileError(pub ErrorKind, pub usize);

impl CompileError {
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }
    pub fn instruction(&self) -> usize {
        self.1
    }
}

impl ReportableError for CompileError {
    fn get_labels(&self) -> Vec<(usize, String)> {
        vec![(self.1, self.0.to_string())]
    }
}

/// Compile-time limits.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub max_flow_var: usize,
    pub max_packet_offset_change: usize,
    pub min_pkt_size: u16,
    /// Report the expected length of RANDOM packet size variables with the
    /// exact mean instead of the sampled estimate.
    pub exact_random_avg: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_flow_var: MAX_FLOW_VAR,
            max_packet_offset_change: MAX_PACKET_OFFSET_CHANGE,
            min_pkt_size: MIN_PKT_SIZE,
            exact_random_avg: false,
        }
    }
}

/// Compiler state shared between compilations: the limits and the memoized
/// random averages.
#[derive(Debug, Default)]
pub struct Context {
    config: Config,
    rand_avg: FastRandAvgCache,
}

impl Context {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            rand_avg: FastRandAvgCache::new(),
        }
    }
    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn rand_avg_cache(&mut self) -> &mut FastRandAvgCache {
        &mut self.rand_avg
    }

    /// Compile against a packet template, reading IPv4 header lengths from it.
    pub fn compile_packet(&mut self, vm: &StreamVm, pkt: &[u8]) -> Result<Program, CompileError> {
        let pkt_len =
            u16::try_from(pkt.len()).map_err(|_| CompileError(ErrorKind::PacketTooLarge(pkt.len()), 0))?;
        self.compile(vm, pkt_len, Some(pkt))
    }

    /// Validate `vm` for packets of `pkt_len` bytes and lower it to bytecode.
    pub fn compile(
        &mut self,
        vm: &StreamVm,
        pkt_len: u16,
        template: Option<&[u8]>,
    ) -> Result<Program, CompileError> {
        let mut instrs = vm.instructions().to_vec();
        let table = VarTable::build(&instrs, &self.config)?;
        if table.declared() == 0 {
            return Err(CompileError(ErrorKind::NoVariable, 0));
        }
        let pkt_size = self.fixup_packet_size(&mut instrs, &table, pkt_len)?;

        let mut generator = ByteCodeGenerator::new(&table, &self.config, pkt_len as usize, template);
        for (idx, instr) in instrs.iter().enumerate() {
            generator.emit(idx, instr)?;
        }
        let program = generator.finish(pkt_size)?;
        log::debug!(
            "compiled {} instruction(s): {} bytes of bytecode, bss {} bytes, prefix {} of {}",
            instrs.len(),
            program.bytecode.len(),
            program.bss.len(),
            program.prefix_size,
            pkt_len
        );
        Ok(program)
    }

    /// Clamp the bounds of the packet size variable, if any, to what the
    /// template allows and compute the expected packet length.
    fn fixup_packet_size(
        &mut self,
        instrs: &mut [Instruction],
        table: &VarTable,
        pkt_len: u16,
    ) -> Result<Option<PktLenData>, CompileError> {
        let mut found = None;
        for (idx, instr) in instrs.iter().enumerate() {
            if let Instruction::ChangePacketSize(c) = instr {
                if found.is_some() {
                    return Err(CompileError(ErrorKind::MultiplePacketSizeChange, idx));
                }
                found = Some((idx, c.var_name.clone()));
            }
        }
        let Some((idx, name)) = found else {
            return Ok(None);
        };
        let err = |kind| CompileError(kind, idx);

        let entry = table.lookup(&name, idx)?;
        if entry.size != 2 {
            return Err(err(ErrorKind::PacketSizeVarWidth {
                name,
                size: entry.size,
            }));
        }
        if entry.kind != VarKind::Flow {
            return Err(err(ErrorKind::PacketSizeVarKind(name)));
        }
        if pkt_len < self.config.min_pkt_size {
            return Err(err(ErrorKind::PacketTooSmall {
                pkt_len: pkt_len as usize,
                min: self.config.min_pkt_size,
            }));
        }
        let Instruction::FlowVar(var) = &mut instrs[entry.instr] else {
            unreachable!("plain flow variable entries always point at a flow_var");
        };

        let pkt_len = pkt_len as u64;
        var.max = var.max.min(pkt_len);
        var.min = var.min.min(pkt_len);
        if var.min >= var.max {
            return Err(err(ErrorKind::InvalidPacketSizeRange {
                min: var.min,
                max: var.max,
            }));
        }
        let floor = self.config.min_pkt_size as u64;
        var.min = var.min.max(floor);
        var.max = var.max.max(var.min);
        var.init = var.init.clamp(var.min, var.max);

        let expected = match var.op {
            FlowOp::Random if self.config.exact_random_avg => {
                var.min as f64 + (var.max - var.min) as f64 / 2.0
            }
            FlowOp::Random => var.min as f64 + self.rand_avg.avg((var.max - var.min) as u16),
            FlowOp::Inc | FlowOp::Dec => (var.min + var.max) as f64 / 2.0,
        };
        Ok(Some(PktLenData {
            min: var.min as u16,
            max: var.max as u16,
            expected,
        }))
    }
}

/// Compile with the default limits and a throwaway random-average cache.
pub fn compile(vm: &StreamVm, pkt: &[u8]) -> Result<Program, CompileError> {
    Context::default().compile_packet(vm, pkt)
}

#[cfg(test)]
mod test;
