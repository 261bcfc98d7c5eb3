//! Per-worker victim selection.
//!
//! Each worker draws steal targets from its own xorshift stream. The stream is
//! derived from `SchedulerConfig::seed` and the worker index, so a fixed seed
//! replays the same sequence of victims (the interleaving still depends on
//! timing).

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Xorshift64 stream owned by one worker.
///
/// No `Copy`: two workers sharing a stream would probe the same peers in
/// lockstep.
#[derive(Clone, Debug)]
pub struct VictimRng {
    s: u64,
}

impl VictimRng {
    /// Stream for worker `index`. Neighbouring indices land far apart in
    /// state space after the splitmix scramble.
    pub fn seeded(seed: u64, index: usize) -> Self {
        let mixed = scramble(seed ^ (index as u64).wrapping_mul(GOLDEN_GAMMA));
        // Zero is a fixed point of xorshift.
        Self {
            s: if mixed == 0 { GOLDEN_GAMMA } else { mixed },
        }
    }

    #[inline]
    fn raw(&mut self) -> u64 {
        let mut s = self.s;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.s = s;
        s
    }

    /// Uniform draw from `0..n`. `n` must be non-zero.
    #[inline]
    pub fn below(&mut self, n: usize) -> usize {
        debug_assert_ne!(n, 0);
        let n = n as u64;
        if n & (n - 1) == 0 {
            return (self.raw() & (n - 1)) as usize;
        }
        // Lemire: reject the low products that would bias the high word.
        let reject_below = n.wrapping_neg() % n;
        loop {
            let wide = u128::from(self.raw()) * u128::from(n);
            if wide as u64 >= reject_below {
                return (wide >> 64) as usize;
            }
        }
    }

    /// A peer of worker `me` among `workers`, never `me` itself.
    #[inline]
    pub fn pick_victim(&mut self, me: usize, workers: usize) -> usize {
        debug_assert!(workers >= 2 && me < workers);
        let v = self.below(workers - 1);
        v + usize::from(v >= me)
    }
}

fn scramble(mut z: u64) -> u64 {
    z = z.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
