use std::collections::HashMap;

use super::{CompileError, Config, ErrorKind, FlowOp, Instruction};
use crate::runtime::vm::{RANDOM_SEED_SIZE, bytecode::CLIENT_BSS_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Flow,
    RandLimit,
    ClientIp,
    ClientPort,
    ClientFlowLimit,
}

/// Where a named variable lives in the BSS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarEntry {
    pub offset: u16,
    pub size: u8,
    pub kind: VarKind,
    /// Index of the declaring instruction.
    pub instr: usize,
}

/// Name to BSS slot map, built by walking the declarations in order.
#[derive(Debug, Default)]
pub struct VarTable {
    vars: HashMap<String, VarEntry>,
    bss_size: usize,
    has_random: bool,
    declared: usize,
}

pub fn max_for_size(size: u8) -> u64 {
    match size {
        1 => u8::MAX as u64,
        2 => u16::MAX as u64,
        4 => u32::MAX as u64,
        _ => u64::MAX,
    }
}

fn check_size(size: u8) -> Result<(), ErrorKind> {
    match size {
        1 | 2 | 4 | 8 => Ok(()),
        _ => Err(ErrorKind::InvalidSize(size)),
    }
}

fn check_bounds(size: u8, min: u64, max: u64) -> Result<(), ErrorKind> {
    check_size(size)?;
    if let Some(value) = [min, max].into_iter().find(|v| *v > max_for_size(size)) {
        return Err(ErrorKind::ValueTooWide { value, size });
    }
    if min >= max {
        return Err(ErrorKind::InvalidRange { min, max });
    }
    Ok(())
}

fn check_instruction(instr: &Instruction) -> Result<(), ErrorKind> {
    match instr {
        Instruction::FlowVar(v) => {
            check_bounds(v.size, v.min, v.max)?;
            if v.op != FlowOp::Random && !(v.min..=v.max).contains(&v.init) {
                return Err(ErrorKind::InitOutOfRange {
                    init: v.init,
                    min: v.min,
                    max: v.max,
                });
            }
            Ok(())
        }
        Instruction::FlowVarRandLimit(v) => {
            check_bounds(v.size, v.min, v.max)?;
            let max = max_for_size(v.size);
            if v.limit == 0 || v.limit > max {
                return Err(ErrorKind::InvalidLimit {
                    limit: v.limit,
                    max,
                });
            }
            Ok(())
        }
        Instruction::FlowClientVar(c) => {
            let (min_ip, max_ip) = (c.ip.min as u64, c.ip.max as u64);
            if min_ip > max_ip {
                return Err(ErrorKind::InvalidRange {
                    min: min_ip,
                    max: max_ip,
                });
            }
            let init = c.ip.init() as u64;
            if !(min_ip..=max_ip).contains(&init) {
                return Err(ErrorKind::InitOutOfRange {
                    init,
                    min: min_ip,
                    max: max_ip,
                });
            }
            let ip_range = max_ip - min_ip + 1;
            if c.ip.step == 0 || c.ip.step as u64 > ip_range {
                return Err(ErrorKind::InvalidStep {
                    step: c.ip.step as u64,
                    range: ip_range,
                });
            }
            let (min_port, max_port) = (c.port.min as u64, c.port.max as u64);
            if min_port > max_port {
                return Err(ErrorKind::InvalidRange {
                    min: min_port,
                    max: max_port,
                });
            }
            let port_range = max_port - min_port + 1;
            if c.port.step as u64 > port_range {
                return Err(ErrorKind::InvalidStep {
                    step: c.port.step as u64,
                    range: port_range,
                });
            }
            if c.flow_limit == Some(0) {
                return Err(ErrorKind::InvalidLimit {
                    limit: 0,
                    max: u32::MAX as u64,
                });
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

impl VarTable {
    /// Validate every declaration and assign BSS offsets in declaration order.
    /// The random seed, when any RANDOM variable exists, takes the first bytes.
    pub fn build(instrs: &[Instruction], config: &Config) -> Result<Self, CompileError> {
        let has_random = instrs
            .iter()
            .any(|i| matches!(i, Instruction::FlowVar(v) if v.op == FlowOp::Random));
        let mut table = VarTable {
            bss_size: if has_random { RANDOM_SEED_SIZE } else { 0 },
            has_random,
            declared: instrs.iter().filter_map(Instruction::declared_name).count(),
            ..Default::default()
        };
        for (idx, instr) in instrs.iter().enumerate() {
            check_instruction(instr).map_err(|kind| CompileError(kind, idx))?;
            match instr {
                Instruction::FlowVar(v) => {
                    table.insert(&v.name, v.size, VarKind::Flow, idx)?;
                    table.reserve(v.size as usize, idx, config)?;
                }
                Instruction::FlowVarRandLimit(v) => {
                    table.insert(&v.name, v.size, VarKind::RandLimit, idx)?;
                    table.reserve(2 * v.size as usize + 4, idx, config)?;
                }
                Instruction::FlowClientVar(c) => {
                    if table.vars.contains_key(&format!("{}.ip", c.name)) {
                        return Err(CompileError(ErrorKind::DuplicateVariable(c.name.clone()), idx));
                    }
                    let base = table.bss_size;
                    table.insert(&format!("{}.ip", c.name), 4, VarKind::ClientIp, idx)?;
                    table.bss_size += 4;
                    table.insert(&format!("{}.port", c.name), 2, VarKind::ClientPort, idx)?;
                    table.bss_size += 2;
                    table.insert(&format!("{}.flow_limit", c.name), 4, VarKind::ClientFlowLimit, idx)?;
                    table.bss_size = base;
                    table.reserve(CLIENT_BSS_SIZE, idx, config)?;
                }
                _ => {}
            }
        }
        // every read must name an earlier declaration
        for (idx, instr) in instrs.iter().enumerate() {
            if let Some(name) = instr.referenced_name() {
                table.lookup(name, idx)?;
            }
        }
        Ok(table)
    }

    fn insert(&mut self, name: &str, size: u8, kind: VarKind, instr: usize) -> Result<(), CompileError> {
        if self.vars.contains_key(name) {
            return Err(CompileError(ErrorKind::DuplicateVariable(name.to_string()), instr));
        }
        let entry = VarEntry {
            offset: self.bss_size as u16,
            size,
            kind,
            instr,
        };
        self.vars.insert(name.to_string(), entry);
        Ok(())
    }

    fn reserve(&mut self, size: usize, instr: usize, config: &Config) -> Result<(), CompileError> {
        self.bss_size += size;
        if self.bss_size > config.max_flow_var {
            return Err(CompileError(
                ErrorKind::BssOverflow {
                    size: self.bss_size,
                    max: config.max_flow_var,
                },
                instr,
            ));
        }
        Ok(())
    }

    /// Resolve a variable referenced by instruction `user`.
    pub fn lookup(&self, name: &str, user: usize) -> Result<VarEntry, CompileError> {
        match self.vars.get(name) {
            Some(entry) if entry.instr < user => Ok(*entry),
            Some(_) => Err(CompileError(
                ErrorKind::UseBeforeDeclaration(name.to_string()),
                user,
            )),
            None => Err(CompileError(ErrorKind::UnknownVariable(name.to_string()), user)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&VarEntry> {
        self.vars.get(name)
    }
    pub fn bss_size(&self) -> usize {
        self.bss_size
    }
    pub fn has_random(&self) -> bool {
        self.has_random
    }
    /// Number of declaring instructions.
    pub fn declared(&self) -> usize {
        self.declared
    }
}
