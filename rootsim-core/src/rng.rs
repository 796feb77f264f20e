//! The per-LP deterministic RNG. Part of the snapshotable state (§9
//! Design Notes) so coast-forward reproduces draws exactly.

/// xorshift128+ state plus the cached half of a Box-Muller pair.
/// `Copy` so it rides along in every `Snapshot` by value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelRng {
    state: [u64; 2],
    cached_gaussian: Option<f64>,
}

impl KernelRng {
    pub fn seeded(seed: u64) -> Self {
        // splitmix64 to spread a single seed into the two xorshift128+ words.
        let mut sm = seed;
        let mut next = || {
            sm = sm.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = sm;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            z ^ (z >> 31)
        };
        Self {
            state: [next(), next()],
            cached_gaussian: None,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state[0];
        let y = self.state[1];
        self.state[0] = y;
        x ^= x << 23;
        x ^= x >> 17;
        x ^= y ^ (y >> 26);
        self.state[1] = x;
        x.wrapping_add(y)
    }

    /// Uniform draw in `[0, 1)`.
    pub fn random(&mut self) -> f64 {
        // 53 bits of mantissa, matching f64's precision.
        let bits = self.next_u64() >> 11;
        (bits as f64) * (1.0 / ((1u64 << 53) as f64))
    }

    /// Uniform draw in `[lo, hi)`.
    pub fn random_range(&mut self, lo: f64, hi: f64) -> f64 {
        debug_assert!(lo <= hi, "random_range called with lo > hi");
        lo + self.random() * (hi - lo)
    }

    /// Exponentially distributed draw with the given mean, via inverse CDF.
    pub fn expent(&mut self, mean: f64) -> f64 {
        debug_assert!(mean > 0.0, "expent mean must be positive");
        // Avoid ln(0.0) = -inf by excluding 0 from the uniform draw.
        let u = 1.0 - self.random();
        -mean * u.ln()
    }

    /// Normally distributed draw via Box-Muller, caching the second
    /// value of each pair so only one fresh pair of uniforms is spent
    /// per two gaussian draws.
    pub fn gaussian(&mut self, mean: f64, sd: f64) -> f64 {
        if let Some(cached) = self.cached_gaussian.take() {
            return mean + sd * cached;
        }
        let (u1, u2) = loop {
            let u1 = self.random();
            if u1 > f64::EPSILON {
                break (u1, self.random());
            }
        };
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        let (z0, z1) = (radius * theta.cos(), radius * theta.sin());
        self.cached_gaussian = Some(z1);
        mean + sd * z0
    }
}
