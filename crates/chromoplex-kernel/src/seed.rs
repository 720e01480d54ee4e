/// Modulus for the per-structure RNG seed stream.
const SEED_MODULUS: u64 = 9_190_037;

/// Derive the kernel RNG seed for one structure at one pipeline step.
///
/// Deterministic in (base_seed, struct_id, step_no) and distinct across
/// structures and iterations, so a restart after failure explores new
/// states while a clean rerun reproduces the same trajectory.
pub fn derive_seed(base_seed: u64, struct_id: u64, step_no: u64) -> u64 {
    base_seed.wrapping_mul(struct_id).wrapping_mul(step_no) % SEED_MODULUS + 1
}

#[cfg(test)]
mod tests {
    use super::derive_seed;

    #[test]
    fn deterministic_and_distinct() {
        let a = derive_seed(42, 3, 7);
        assert_eq!(a, derive_seed(42, 3, 7));
        assert_ne!(a, derive_seed(42, 3, 8));
        assert_ne!(a, derive_seed(42, 4, 7));
    }

    #[test]
    fn always_positive_and_bounded() {
        for s in 0..50 {
            let v = derive_seed(0, s, 0);
            assert!(v >= 1 && v <= 9_190_037);
        }
    }
}
