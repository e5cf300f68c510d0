use rand::{Rng, RngCore, SeedableRng};
use rand_distr::Distribution;
use rand_distr::WeightedAliasIndex;
use rand_xoshiro::Xoshiro512PlusPlus;

pub const KEY_LEN: usize = 32;

/// Weighted cohort selection: a Vose alias table over the weight vector, a
/// dedicated selection stream, and one deterministic key stream per cohort
/// (seeded by cohort index + 1) so that matching weights revisit the same
/// key-space across runs.
struct Cohorts {
    dist: WeightedAliasIndex<f64>,
    sel: Xoshiro512PlusPlus,
    rngs: Vec<Xoshiro512PlusPlus>,
}

/// Deterministic key producer. Two independent streams: one dedicated to key
/// material, one for auxiliary draws (field expansion, sample selection), so
/// changing the workload mix does not perturb key sequences.
///
/// Instances are single-owner; the generation stage calls them without
/// synchronization.
pub struct KeyGenerator {
    rkey: Xoshiro512PlusPlus,
    raux: Xoshiro512PlusPlus,
    cohorts: Option<Cohorts>,
}

fn resolve_seed(seed: u64) -> u64 {
    if seed != 0 {
        return seed;
    }
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

impl KeyGenerator {
    /// A seed of 0 means "use current time nanoseconds"; any other seed
    /// yields byte-identical streams across runs. A non-empty `weights`
    /// vector enables cohort mode.
    pub fn new(seed: u64, weights: &[f64]) -> Self {
        let seed = resolve_seed(seed);

        let cohorts = if weights.is_empty() {
            None
        } else {
            let dist = WeightedAliasIndex::new(weights.to_vec())
                .expect("cohort weights must be finite and positive");
            let rngs = (0..weights.len())
                .map(|i| Xoshiro512PlusPlus::seed_from_u64(i as u64 + 1))
                .collect();
            Some(Cohorts {
                dist,
                sel: Xoshiro512PlusPlus::seed_from_u64(seed),
                rngs,
            })
        };

        Self {
            rkey: Xoshiro512PlusPlus::seed_from_u64(seed),
            raux: Xoshiro512PlusPlus::seed_from_u64(seed),
            cohorts,
        }
    }

    /// Next 32-character lowercase-hex key.
    pub fn next_key(&mut self) -> String {
        let mut buf = [0u8; KEY_LEN];
        self.fill_key(&mut buf);
        // fill_key writes hex digits only
        unsafe { String::from_utf8_unchecked(buf.to_vec()) }
    }

    /// Writes the next key into `buf[0..32]` in place, for zero-allocation
    /// overlay into cached payloads.
    pub fn fill_key(&mut self, buf: &mut [u8]) {
        let mut raw = [0u8; KEY_LEN / 2];
        match &mut self.cohorts {
            Some(cohorts) => {
                let idx = cohorts.dist.sample(&mut cohorts.sel);
                cohorts.rngs[idx].fill_bytes(&mut raw);
            }
            None => self.rkey.fill_bytes(&mut raw),
        }
        hex::encode_to_slice(raw, &mut buf[..KEY_LEN]).expect("key buffer too small");
    }

    /// Uniform integer in [0, n), drawn from the auxiliary stream.
    pub fn next_intn(&mut self, n: usize) -> usize {
        self.raux.gen_range(0..n)
    }

    /// `base` concatenated with the decimal form of a uniform draw in
    /// [0, r), used to expand field templates.
    pub fn next_key_for(&mut self, base: &str, r: u32) -> String {
        let suffix = self.raux.gen_range(0..r);
        format!("{base}{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_are_32_lowercase_hex() {
        let mut keygen = KeyGenerator::new(7, &[]);
        for _ in 0..100 {
            let key = keygen.next_key();
            assert_eq!(key.len(), 32);
            assert!(key
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
        }
    }

    #[test]
    fn fixed_seed_reproduces_streams() {
        let mut a = KeyGenerator::new(42, &[]);
        let mut b = KeyGenerator::new(42, &[]);
        for _ in 0..1000 {
            assert_eq!(a.next_key(), b.next_key());
        }
    }

    #[test]
    fn zero_seed_is_time_based() {
        let mut a = KeyGenerator::new(0, &[]);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut b = KeyGenerator::new(0, &[]);
        let a_keys: Vec<_> = (0..4).map(|_| a.next_key()).collect();
        let b_keys: Vec<_> = (0..4).map(|_| b.next_key()).collect();
        assert_ne!(a_keys, b_keys);
    }

    #[test]
    fn aux_draws_do_not_perturb_key_stream() {
        let mut plain = KeyGenerator::new(9, &[]);
        let mut mixed = KeyGenerator::new(9, &[]);

        let mut expected = Vec::new();
        for _ in 0..100 {
            expected.push(plain.next_key());
        }

        let mut observed = Vec::new();
        for i in 0..100 {
            // interleave auxiliary draws; the key stream must not notice
            let _ = mixed.next_intn(10);
            let _ = mixed.next_key_for("col", 4);
            if i % 3 == 0 {
                let _ = mixed.next_intn(1000);
            }
            observed.push(mixed.next_key());
        }

        assert_eq!(expected, observed);
    }

    #[test]
    fn fill_key_matches_next_key() {
        let mut a = KeyGenerator::new(11, &[]);
        let mut b = KeyGenerator::new(11, &[]);
        for _ in 0..50 {
            let mut buf = [b'x'; 40];
            a.fill_key(&mut buf);
            assert_eq!(&buf[..32], b.next_key().as_bytes());
            // bytes past the key region untouched
            assert!(buf[32..].iter().all(|b| *b == b'x'));
        }
    }

    #[test]
    fn next_key_for_appends_decimal_suffix() {
        let mut keygen = KeyGenerator::new(3, &[]);
        for _ in 0..200 {
            let name = keygen.next_key_for("col", 4);
            let suffix: u32 = name.strip_prefix("col").unwrap().parse().unwrap();
            assert!(suffix < 4);
        }
    }

    #[test]
    fn cohort_streams_are_deterministic_per_index() {
        // same weights and seed revisit the same key-space across runs
        let mut a = KeyGenerator::new(5, &[0.5, 0.5]);
        let mut b = KeyGenerator::new(5, &[0.5, 0.5]);
        for _ in 0..1000 {
            assert_eq!(a.next_key(), b.next_key());
        }
    }

    #[test]
    fn cohort_keys_come_from_cohort_seeds() {
        // with a single cohort every key must follow the stream seeded 1,
        // regardless of the generator's own seed
        let mut skewed = KeyGenerator::new(99, &[1.0]);
        let mut reference = Xoshiro512PlusPlus::seed_from_u64(1);
        for _ in 0..100 {
            let mut raw = [0u8; 16];
            reference.fill_bytes(&mut raw);
            assert_eq!(skewed.next_key(), hex::encode(raw));
        }
    }

    #[test]
    fn cohort_frequencies_match_weights() {
        // cohort 0 keys follow seed 1, cohort 1 keys follow seed 2; classify
        // draws by matching prefixes against both reference streams
        let mut keygen = KeyGenerator::new(13, &[0.9, 0.1]);
        let mut ref0 = Xoshiro512PlusPlus::seed_from_u64(1);
        let mut ref1 = Xoshiro512PlusPlus::seed_from_u64(2);

        let mut expect0 = HashSet::new();
        let mut expect1 = HashSet::new();
        let n = 100_000;
        for _ in 0..n {
            let mut raw = [0u8; 16];
            ref0.fill_bytes(&mut raw);
            expect0.insert(hex::encode(raw));
            ref1.fill_bytes(&mut raw);
            expect1.insert(hex::encode(raw));
        }

        let mut hits0 = 0usize;
        let mut hits1 = 0usize;
        for _ in 0..n {
            let key = keygen.next_key();
            if expect0.contains(&key) {
                hits0 += 1;
            } else if expect1.contains(&key) {
                hits1 += 1;
            } else {
                panic!("key from neither cohort stream");
            }
        }

        let frac0 = hits0 as f64 / n as f64;
        let frac1 = hits1 as f64 / n as f64;
        assert!((frac0 - 0.9).abs() < 0.01, "cohort-0 fraction {frac0}");
        assert!((frac1 - 0.1).abs() < 0.01, "cohort-1 fraction {frac1}");
    }

    #[test]
    fn next_intn_stays_in_range() {
        let mut keygen = KeyGenerator::new(21, &[]);
        for _ in 0..10_000 {
            assert!(keygen.next_intn(7) < 7);
        }
    }
}
