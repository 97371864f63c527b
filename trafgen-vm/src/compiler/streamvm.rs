use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::instruction::{FlowOp, Instruction};
use crate::runtime::{
    fastrand::mix_seed,
    vm::{dec_mod, inc_mod},
};

/// Ordered list of instructions describing how one stream mutates its packet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamVm {
    instructions: Vec<Instruction>,
}

impl StreamVm {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn add_instruction(&mut self, instr: impl Into<Instruction>) -> &mut Self {
        self.instructions.push(instr.into());
        self
    }
    pub fn with(mut self, instr: impl Into<Instruction>) -> Self {
        self.instructions.push(instr.into());
        self
    }
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Rewrite the program for core `phase` out of `step_mul` cores sending the
    /// same stream, so that the cores together walk the same value sequence a
    /// single core would.
    pub fn split(&self, phase: u32, step_mul: u32) -> StreamVm {
        let step_mul = step_mul.max(1);
        debug_assert!(phase < step_mul, "phase {phase} out of {step_mul} cores");
        let instructions = self
            .instructions
            .iter()
            .cloned()
            .map(|instr| match instr {
                Instruction::FlowVar(mut v) if v.op != FlowOp::Random => {
                    let range = v.range();
                    let skip = mul_mod(v.step, phase as u64, range);
                    v.init = match v.op {
                        FlowOp::Dec => dec_mod(v.min, v.max, v.init, skip),
                        _ => inc_mod(v.min, v.max, v.init, skip),
                    };
                    v.step = mul_mod(v.step, step_mul as u64, range);
                    Instruction::FlowVar(v)
                }
                Instruction::FlowVarRandLimit(mut v) => {
                    v.seed = mix_seed(v.seed, phase as u8);
                    v.limit = split_limit(v.limit, phase, step_mul);
                    Instruction::FlowVarRandLimit(v)
                }
                Instruction::FlowClientVar(mut c) => {
                    let range = (c.ip.max as u64).wrapping_sub(c.ip.min as u64).wrapping_add(1);
                    let skip = mul_mod(c.ip.step as u64, phase as u64, range);
                    let init = inc_mod(c.ip.min as u64, c.ip.max as u64, c.ip.init() as u64, skip);
                    c.ip.init = Some(init as u32);
                    c.ip.step = mul_mod(c.ip.step as u64, step_mul as u64, range) as u32;
                    c.flow_limit = c
                        .flow_limit
                        .map(|l| split_limit(l as u64, phase, step_mul) as u32);
                    Instruction::FlowClientVar(c)
                }
                other => other,
            })
            .collect();
        StreamVm { instructions }
    }
}

/// `a * b mod range`, where a `range` of 0 is the full 64-bit space.
fn mul_mod(a: u64, b: u64, range: u64) -> u64 {
    if range == 0 {
        a.wrapping_mul(b)
    } else {
        ((a as u128 * b as u128) % range as u128) as u64
    }
}

/// Share of `limit` owned by core `phase`; the remainder goes to the lowest
/// phases. Every core keeps at least one.
fn split_limit(limit: u64, phase: u32, step_mul: u32) -> u64 {
    let (per_core, rest) = (limit / step_mul as u64, limit % step_mul as u64);
    let extra = u64::from((phase as u64) < rest);
    (per_core + extra).max(1)
}

impl From<Vec<Instruction>> for StreamVm {
    fn from(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }
}

impl FromIterator<Instruction> for StreamVm {
    fn from_iter<T: IntoIterator<Item = Instruction>>(iter: T) -> Self {
        Self {
            instructions: iter.into_iter().collect(),
        }
    }
}

/// One line per instruction, so that error reports can point at a line by
/// instruction index.
impl fmt::Display for StreamVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self
            .instructions
            .iter()
            .enumerate()
            .map(|(i, instr)| format!("{i:03}: {instr}"))
            .join("\n");
        write!(f, "{lines}")
    }
}
