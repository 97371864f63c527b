use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowOp {
    Inc,
    Dec,
    Random,
}

impl fmt::Display for FlowOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowOp::Inc => write!(f, "inc"),
            FlowOp::Dec => write!(f, "dec"),
            FlowOp::Random => write!(f, "random"),
        }
    }
}

fn one() -> u64 {
    1
}
fn one_u32() -> u32 {
    1
}
fn yes() -> bool {
    true
}

/// A counter or random generator of `size` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowVar {
    pub name: String,
    pub size: u8,
    pub op: FlowOp,
    #[serde(default)]
    pub init: u64,
    pub min: u64,
    pub max: u64,
    #[serde(default = "one")]
    pub step: u64,
}

impl FlowVar {
    pub fn new(name: impl Into<String>, size: u8, op: FlowOp, min: u64, max: u64) -> Self {
        Self {
            name: name.into(),
            size,
            op,
            init: min,
            min,
            max,
            step: 1,
        }
    }
    pub fn with_init(mut self, init: u64) -> Self {
        self.init = init;
        self
    }
    pub fn with_step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }
    /// Width of `[min, max]`; 0 stands for the full 64-bit range.
    pub fn range(&self) -> u64 {
        self.max.wrapping_sub(self.min).wrapping_add(1)
    }
}

/// Random generator that keeps each drawn value for `limit` consecutive
/// packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowVarRandLimit {
    pub name: String,
    pub size: u8,
    pub limit: u64,
    #[serde(default)]
    pub seed: u32,
    pub min: u64,
    pub max: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub min: u32,
    pub max: u32,
    #[serde(default = "one_u32")]
    pub step: u32,
    /// First address handed out, `min` when absent.
    #[serde(default)]
    pub init: Option<u32>,
}

impl IpRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self {
            min,
            max,
            step: 1,
            init: None,
        }
    }
    pub fn init(&self) -> u32 {
        self.init.unwrap_or(self.min)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
    #[serde(default)]
    pub step: u16,
}

/// Generator of (client IP, client port) pairs. Registers `name.ip`,
/// `name.port` and `name.flow_limit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowClientVar {
    pub name: String,
    pub ip: IpRange,
    pub port: PortRange,
    /// Restart from the first pair after this many packets.
    #[serde(default)]
    pub flow_limit: Option<u32>,
    #[serde(default)]
    pub unlimited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteToPacket {
    pub var_name: String,
    pub pkt_offset: u16,
    #[serde(default)]
    pub add_value: i32,
    #[serde(default = "yes")]
    pub big_endian: bool,
}

impl WriteToPacket {
    pub fn new(var_name: impl Into<String>, pkt_offset: u16) -> Self {
        Self {
            var_name: var_name.into(),
            pkt_offset,
            add_value: 0,
            big_endian: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteMaskToPacket {
    pub var_name: String,
    pub pkt_offset: u16,
    pub pkt_cast_size: u8,
    pub mask: u32,
    #[serde(default)]
    pub shift: i8,
    #[serde(default)]
    pub add_value: i32,
    #[serde(default = "yes")]
    pub big_endian: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixChecksumIpv4 {
    pub pkt_offset: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePacketSize {
    pub var_name: String,
}

/// One step of a stream mutation program as authored by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Instruction {
    FlowVar(FlowVar),
    FlowVarRandLimit(FlowVarRandLimit),
    FlowClientVar(FlowClientVar),
    WriteToPacket(WriteToPacket),
    WriteMaskToPacket(WriteMaskToPacket),
    FixChecksumIpv4(FixChecksumIpv4),
    ChangePacketSize(ChangePacketSize),
}

impl Instruction {
    /// Name declared by this instruction, if it declares a variable.
    pub fn declared_name(&self) -> Option<&str> {
        match self {
            Instruction::FlowVar(v) => Some(&v.name),
            Instruction::FlowVarRandLimit(v) => Some(&v.name),
            Instruction::FlowClientVar(v) => Some(&v.name),
            _ => None,
        }
    }
    /// Name of the variable this instruction reads, if any.
    pub fn referenced_name(&self) -> Option<&str> {
        match self {
            Instruction::WriteToPacket(w) => Some(&w.var_name),
            Instruction::WriteMaskToPacket(w) => Some(&w.var_name),
            Instruction::ChangePacketSize(c) => Some(&c.var_name),
            _ => None,
        }
    }
}

impl From<FlowVar> for Instruction {
    fn from(v: FlowVar) -> Self {
        Instruction::FlowVar(v)
    }
}
impl From<FlowVarRandLimit> for Instruction {
    fn from(v: FlowVarRandLimit) -> Self {
        Instruction::FlowVarRandLimit(v)
    }
}
impl From<FlowClientVar> for Instruction {
    fn from(v: FlowClientVar) -> Self {
        Instruction::FlowClientVar(v)
    }
}
impl From<WriteToPacket> for Instruction {
    fn from(v: WriteToPacket) -> Self {
        Instruction::WriteToPacket(v)
    }
}
impl From<WriteMaskToPacket> for Instruction {
    fn from(v: WriteMaskToPacket) -> Self {
        Instruction::WriteMaskToPacket(v)
    }
}
impl From<FixChecksumIpv4> for Instruction {
    fn from(v: FixChecksumIpv4) -> Self {
        Instruction::FixChecksumIpv4(v)
    }
}
impl From<ChangePacketSize> for Instruction {
    fn from(v: ChangePacketSize) -> Self {
        Instruction::ChangePacketSize(v)
    }
}

fn fmt_ip(ip: u32) -> std::net::Ipv4Addr {
    std::net::Ipv4Addr::from(ip)
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::FlowVar(v) => write!(
                f,
                "flow_var {} size:{} op:{} init:{} min:{} max:{} step:{}",
                v.name, v.size, v.op, v.init, v.min, v.max, v.step
            ),
            Instruction::FlowVarRandLimit(v) => write!(
                f,
                "flow_var_rand_limit {} size:{} limit:{} seed:{:#x} min:{} max:{}",
                v.name, v.size, v.limit, v.seed, v.min, v.max
            ),
            Instruction::FlowClientVar(v) => {
                write!(
                    f,
                    "flow_client_var {} ip:{}-{}/{} port:{}-{}/{}",
                    v.name,
                    fmt_ip(v.ip.min),
                    fmt_ip(v.ip.max),
                    v.ip.step,
                    v.port.min,
                    v.port.max,
                    v.port.step
                )?;
                if let Some(limit) = v.flow_limit {
                    write!(f, " limit:{limit}")?;
                }
                if v.unlimited {
                    write!(f, " unlimited")?;
                }
                Ok(())
            }
            Instruction::WriteToPacket(w) => write!(
                f,
                "write {} -> pkt[{}] add:{} big:{}",
                w.var_name, w.pkt_offset, w.add_value, w.big_endian
            ),
            Instruction::WriteMaskToPacket(w) => write!(
                f,
                "write_mask {} -> pkt[{}]/{} mask:{:#x} shift:{} add:{} big:{}",
                w.var_name, w.pkt_offset, w.pkt_cast_size, w.mask, w.shift, w.add_value, w.big_endian
            ),
            Instruction::FixChecksumIpv4(c) => write!(f, "fix_checksum_ipv4 pkt[{}]", c.pkt_offset),
            Instruction::ChangePacketSize(c) => write!(f, "change_packet_size {}", c.var_name),
        }
    }
}
