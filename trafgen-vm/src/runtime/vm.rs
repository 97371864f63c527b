use std::mem::size_of;

use bytemuck::Pod;

pub mod bytecode;
pub mod checksum;
pub mod program;

pub use bytecode::OpCode;
use bytecode::*;
pub use program::{PktLenData, Program};

use super::fastrand::{fastrand, rand16, rand32, rand64};

/// Byte offset of the per-stream random seed inside the BSS.
pub const RANDOM_SEED_OFFSET: usize = 0;
pub const RANDOM_SEED_SIZE: usize = size_of::<u32>();

#[inline]
pub(crate) fn load<T: Pod>(buf: &[u8], offset: usize) -> T {
    bytemuck::pod_read_unaligned(&buf[offset..offset + size_of::<T>()])
}

#[inline]
pub(crate) fn store<T: Pod>(buf: &mut [u8], offset: usize, val: T) {
    buf[offset..offset + size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&val));
}

/// `cur + 1`, wrapping from `max` to `min`.
#[inline]
pub fn inc(min: u64, max: u64, cur: u64) -> u64 {
    if cur >= max { min } else { cur + 1 }
}

/// `cur - 1`, wrapping from `min` to `max`.
#[inline]
pub fn dec(min: u64, max: u64, cur: u64) -> u64 {
    if cur <= min { max } else { cur - 1 }
}

/// `cur + step` inside `[min, max]`, together with whether the value wrapped.
/// `step` must be smaller than the width of the range.
#[inline]
pub fn inc_mod_of(min: u64, max: u64, cur: u64, step: u64) -> (u64, bool) {
    let room = max.wrapping_sub(cur);
    if step <= room {
        (cur.wrapping_add(step), false)
    } else {
        (min.wrapping_add(step - room - 1), true)
    }
}

#[inline]
pub fn inc_mod(min: u64, max: u64, cur: u64, step: u64) -> u64 {
    inc_mod_of(min, max, cur, step).0
}

/// `cur - step` inside `[min, max]`.
#[inline]
pub fn dec_mod(min: u64, max: u64, cur: u64, step: u64) -> u64 {
    let room = cur.wrapping_sub(min);
    if step <= room {
        cur.wrapping_sub(step)
    } else {
        max.wrapping_sub(step - room - 1)
    }
}

#[inline]
fn draw8(seed: &mut u32) -> u64 {
    fastrand(seed) as u64
}
#[inline]
fn draw16(seed: &mut u32) -> u64 {
    rand16(seed) as u64
}
#[inline]
fn draw32(seed: &mut u32) -> u64 {
    rand32(seed) as u64
}
#[inline]
fn draw64(seed: &mut u32) -> u64 {
    rand64(seed)
}

/// Uniform draw from `[min, max]`.
#[inline]
fn random_in(seed: &mut u32, min: u64, max: u64, draw: fn(&mut u32) -> u64) -> u64 {
    let span = max.wrapping_sub(min);
    if span == u64::MAX {
        draw(seed)
    } else {
        min + draw(seed) % (span + 1)
    }
}

macro_rules! unit_op {
    ($f:ident, $m:ident, $program:expr, $pc:expr, $bss:expr) => {{
        let r: $m::Range = read_record($program, $pc);
        let var = r.var as usize;
        let cur = load::<$m::Value>($bss, var) as u64;
        store::<$m::Value>($bss, var, $f(r.min as u64, r.max as u64, cur) as $m::Value);
    }};
}

macro_rules! step_op {
    ($f:ident, $m:ident, $program:expr, $pc:expr, $bss:expr) => {{
        let r: $m::Step = read_record($program, $pc);
        let var = r.var as usize;
        let cur = load::<$m::Value>($bss, var) as u64;
        let next = $f(r.min as u64, r.max as u64, cur, r.step as u64);
        store::<$m::Value>($bss, var, next as $m::Value);
    }};
}

macro_rules! random_op {
    ($m:ident, $draw:ident, $program:expr, $pc:expr, $bss:expr) => {{
        let r: $m::Range = read_record($program, $pc);
        let mut seed = load::<u32>($bss, RANDOM_SEED_OFFSET);
        let val = random_in(&mut seed, r.min as u64, r.max as u64, $draw);
        store::<u32>($bss, RANDOM_SEED_OFFSET, seed);
        store::<$m::Value>($bss, r.var as usize, val as $m::Value);
    }};
}

// BSS block: value, count, seed.
macro_rules! rand_limit_op {
    ($m:ident, $draw:ident, $program:expr, $pc:expr, $bss:expr) => {{
        let r: $m::RandLimit = read_record($program, $pc);
        let width = size_of::<$m::Value>();
        let base = r.var as usize;
        let mut cnt = load::<$m::Value>($bss, base + width) as u64;
        if cnt == 0 {
            let mut seed = load::<u32>($bss, base + 2 * width);
            let val = random_in(&mut seed, r.min as u64, r.max as u64, $draw);
            store::<u32>($bss, base + 2 * width, seed);
            store::<$m::Value>($bss, base, val as $m::Value);
        }
        cnt += 1;
        if cnt >= r.limit as u64 {
            cnt = 0;
        }
        store::<$m::Value>($bss, base + width, cnt as $m::Value);
    }};
}

macro_rules! wr_op {
    ($m:ident, $program:expr, $pc:expr, $bss:expr, $pkt:expr) => {{
        let r: $m::Wr = read_record($program, $pc);
        let val = load::<$m::Value>($bss, r.var as usize).wrapping_add(r.add as $m::Value);
        let offset = r.pkt_offset as usize;
        if r.flags & FLAG_BIG_ENDIAN != 0 {
            store($pkt, offset, val.to_be());
        } else {
            store($pkt, offset, val);
        }
    }};
}

// read-modify-write of a packet field; `$swap` converts between wire and host order
macro_rules! rmw {
    ($t:ty, $swap:path, $pkt:expr, $offset:expr, $val:expr, $mask:expr) => {{
        let mask = $mask as $t;
        let cur = $swap(load::<$t>($pkt, $offset));
        let next = (cur & !mask) | (($val as $t) & mask);
        store::<$t>($pkt, $offset, $swap(next));
    }};
}

#[inline]
fn host<T>(v: T) -> T {
    v
}

fn wr_mask(r: WrMaskRec, bss: &[u8], pkt: &mut [u8]) {
    let var = r.var as usize;
    let offset = r.pkt_offset as usize;
    let shift = r.shift;
    let mask = r.mask;
    let mut val: u32 = match r.flowv_cast_size {
        1 => load::<u8>(bss, var) as u32,
        2 => load::<u16>(bss, var) as u32,
        _ => load::<u32>(bss, var),
    };
    val = val.wrapping_add(r.add as u32);
    if shift > 0 {
        val = val.checked_shl(shift as u32).unwrap_or(0);
    } else if shift < 0 {
        val = val.checked_shr(shift.unsigned_abs() as u32).unwrap_or(0);
    }
    if r.flags & FLAG_BIG_ENDIAN != 0 {
        // wire order, sized by the packet field
        match r.pkt_cast_size {
            1 => rmw!(u8, host, pkt, offset, val, mask),
            2 => rmw!(u16, u16::from_be, pkt, offset, val, mask),
            _ => rmw!(u32, u32::from_be, pkt, offset, val, mask),
        }
    } else {
        // host order, sized by the flow variable
        match r.flowv_cast_size {
            1 => rmw!(u8, host, pkt, offset, val, mask),
            2 => rmw!(u16, host, pkt, offset, val, mask),
            _ => rmw!(u32, host, pkt, offset, val, mask),
        }
    }
}

fn client_limited(r: ClientRec, bss: &mut [u8]) {
    let base = r.var as usize;
    let (min_port, max_port) = (r.min_port as u64, r.max_port as u64);
    let cur_ip = load::<u32>(bss, base + CLIENT_IP_OFFSET) as u64;
    let cur_port = load::<u16>(bss, base + CLIENT_PORT_OFFSET) as u64;

    // the IP is the inner loop, the port moves on every IP wrap-around
    let (mut ip, wrapped) = inc_mod_of(r.min_ip as u64, r.max_ip as u64, cur_ip, r.step_ip as u64);
    let mut port = inc_mod(min_port, max_port, cur_port, r.step_port as u64);
    if wrapped {
        port = inc_mod(min_port, max_port, port, 1);
    }

    if r.flags & FLAG_LIMIT_FLOWS != 0 {
        let mut flow_id = load::<u32>(bss, base + CLIENT_FLOW_ID_OFFSET).wrapping_add(1);
        if flow_id > r.limit_flows {
            flow_id = 1;
            ip = r.init_ip as u64;
            port = r.init_port as u64;
        }
        store::<u32>(bss, base + CLIENT_FLOW_ID_OFFSET, flow_id);
    }
    store::<u32>(bss, base + CLIENT_IP_OFFSET, ip as u32);
    store::<u16>(bss, base + CLIENT_PORT_OFFSET, port as u16);
}

/// Port the unlimited client generator restarts from after wrapping past 65535.
pub const CLIENT_UNLIMITED_MIN_PORT: u16 = 1025;

fn client_unlimited(r: ClientUnlimitedRec, bss: &mut [u8]) {
    let base = r.var as usize;
    let mut ip = load::<u32>(bss, base + CLIENT_IP_OFFSET).wrapping_add(1);
    let max_ip = r.max_ip;
    if ip > max_ip || ip < r.min_ip {
        ip = r.min_ip;
        let mut port = load::<u16>(bss, base + CLIENT_PORT_OFFSET).wrapping_add(1);
        if port == 0 {
            port = CLIENT_UNLIMITED_MIN_PORT;
        }
        store::<u16>(bss, base + CLIENT_PORT_OFFSET, port);
    }
    store::<u32>(bss, base + CLIENT_IP_OFFSET, ip);
}

/// Execute every record of `program` once.
///
/// `bss` is the private flow variable store of one playback instance and `pkt`
/// the writable packet prefix. Returns the packet length selected by a
/// `pkt_size_change` record, or 0 when the template length stays in effect.
///
/// # Panics
/// On an opcode byte the compiler never emits. Programs are only produced by
/// [`compiler::Context`](crate::compiler::Context) in the same process, so
/// this means the program bytes were corrupted.
pub fn run(bss: &mut [u8], program: &[u8], pkt: &mut [u8]) -> u16 {
    let mut new_pkt_size = 0u16;
    let mut pc = 0;
    while pc < program.len() {
        let Some(op) = OpCode::from_u8(program[pc]) else {
            panic!(
                "corrupted stream program: unknown opcode {:#04x} at byte {pc}",
                program[pc]
            );
        };
        match op {
            OpCode::Inc8 => unit_op!(inc, b8, program, pc, bss),
            OpCode::Inc16 => unit_op!(inc, b16, program, pc, bss),
            OpCode::Inc32 => unit_op!(inc, b32, program, pc, bss),
            OpCode::Inc64 => unit_op!(inc, b64, program, pc, bss),
            OpCode::Dec8 => unit_op!(dec, b8, program, pc, bss),
            OpCode::Dec16 => unit_op!(dec, b16, program, pc, bss),
            OpCode::Dec32 => unit_op!(dec, b32, program, pc, bss),
            OpCode::Dec64 => unit_op!(dec, b64, program, pc, bss),
            OpCode::Inc8Step => step_op!(inc_mod, b8, program, pc, bss),
            OpCode::Inc16Step => step_op!(inc_mod, b16, program, pc, bss),
            OpCode::Inc32Step => step_op!(inc_mod, b32, program, pc, bss),
            OpCode::Inc64Step => step_op!(inc_mod, b64, program, pc, bss),
            OpCode::Dec8Step => step_op!(dec_mod, b8, program, pc, bss),
            OpCode::Dec16Step => step_op!(dec_mod, b16, program, pc, bss),
            OpCode::Dec32Step => step_op!(dec_mod, b32, program, pc, bss),
            OpCode::Dec64Step => step_op!(dec_mod, b64, program, pc, bss),
            OpCode::Random8 => random_op!(b8, draw8, program, pc, bss),
            OpCode::Random16 => random_op!(b16, draw16, program, pc, bss),
            OpCode::Random32 => random_op!(b32, draw32, program, pc, bss),
            OpCode::Random64 => random_op!(b64, draw64, program, pc, bss),
            OpCode::RandLimit8 => rand_limit_op!(b8, draw8, program, pc, bss),
            OpCode::RandLimit16 => rand_limit_op!(b16, draw16, program, pc, bss),
            OpCode::RandLimit32 => rand_limit_op!(b32, draw32, program, pc, bss),
            OpCode::RandLimit64 => rand_limit_op!(b64, draw64, program, pc, bss),
            OpCode::Wr8 => wr_op!(b8, program, pc, bss, pkt),
            OpCode::Wr16 => wr_op!(b16, program, pc, bss, pkt),
            OpCode::Wr32 => wr_op!(b32, program, pc, bss, pkt),
            OpCode::Wr64 => wr_op!(b64, program, pc, bss, pkt),
            OpCode::WrMask => wr_mask(read_record(program, pc), bss, pkt),
            OpCode::FixIpv4Cs => {
                let r: FixIpv4Rec = read_record(program, pc);
                checksum::fix_ipv4_checksum(pkt, r.pkt_offset as usize);
            }
            OpCode::PktSizeChange => {
                let r: PktSizeRec = read_record(program, pc);
                new_pkt_size = load::<u16>(bss, r.var as usize);
            }
            OpCode::ClientVar => client_limited(read_record(program, pc), bss),
            OpCode::ClientVarUnlimited => client_unlimited(read_record(program, pc), bss),
        }
        pc += op.record_len();
    }
    new_pkt_size
}
