// Small deterministic PRNG for ambient events and weight init.
//
// Not cryptographically secure. The raw state is exposed so environments can
// persist it inside their snapshots and replay identically after a load.

const ZERO_GUARD: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        Self::from_state(seed)
    }

    pub fn from_state(state: u64) -> Self {
        // xorshift never leaves zero.
        let state = if state == 0 { ZERO_GUARD } else { state };
        Self { state }
    }

    pub fn state(&self) -> u64 {
        self.state
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Uniform in `[0, 1)`.
    #[inline]
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    #[inline]
    pub fn range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32()
    }

    #[inline]
    pub fn index(&mut self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        (self.next_u32() as usize) % len
    }

    pub fn chance(&mut self, p: f32) -> bool {
        self.next_f32() < p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restoring_state_replays_the_sequence() {
        let mut a = Prng::new(7);
        a.next_u32();
        let mut b = Prng::from_state(a.state());
        for _ in 0..16 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn floats_stay_in_unit_interval() {
        let mut r = Prng::new(0);
        for _ in 0..1000 {
            let v = r.next_f32();
            assert!((0.0..1.0).contains(&v));
        }
        assert_eq!(r.index(0), 0);
        assert!(r.index(3) < 3);
    }
}
