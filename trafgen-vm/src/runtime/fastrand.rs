//! The linear congruential generator used by every random flow variable.
//!
//! One multiply-add per 15 bits.

/// Advance `seed` and return 15 random bits.
#[inline]
pub fn fastrand(seed: &mut u32) -> u16 {
    *seed = seed.wrapping_mul(214013).wrapping_add(2531011);
    ((*seed >> 16) & 0x7FFF) as u16
}

/// 16 random bits out of two 15-bit draws.
#[inline]
pub fn rand16(seed: &mut u32) -> u32 {
    let hi = fastrand(seed) as u32;
    let lo = fastrand(seed) as u32;
    ((hi << 15) | lo) & 0xFFFF
}

#[inline]
pub fn rand32(seed: &mut u32) -> u32 {
    let hi = rand16(seed);
    let lo = rand16(seed);
    (hi << 16) | lo
}

#[inline]
pub fn rand64(seed: &mut u32) -> u64 {
    let hi = rand32(seed) as u64;
    let lo = rand32(seed) as u64;
    (hi << 32).wrapping_add(lo)
}

/// Mix a per-stream seed with the core id so that replicas of one stream on
/// different cores draw different sequences.
pub fn mix_seed(seed: u32, thread_id: u8) -> u32 {
    let mul = (thread_id as u64 + 1) * 514229;
    ((seed as u64).wrapping_mul(mul) & 0xFFFF_FFFF) as u32
}
