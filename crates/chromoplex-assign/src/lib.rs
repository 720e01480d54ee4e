//! Assignment engines.
//!
//! Each modality reads the committed population plus its target data and the
//! previous iteration's artifact, and produces a new assignment artifact:
//! activation distances for Hi-C and DamID, explicit structure/bead picks
//! for SPRITE, per-structure distance targets for FISH.

pub mod actdist;
pub mod damid;
pub mod fish;
pub mod matrix;
pub mod sprite;

/// Iterative correction: how much new probability must be imposed given the
/// already-satisfied fraction `q`.
///
/// `clean(p, q) = max(0, (p - q) / (1 - q))` for `q < 1`, else `max(0, p)`.
pub fn clean_probability(p: f64, q: f64) -> f64 {
    let cleaned = if q < 1.0 { (p - q) / (1.0 - q) } else { p };
    cleaned.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::clean_probability;
    use proptest::prelude::*;

    #[test]
    fn satisfied_targets_need_no_new_probability() {
        assert_eq!(clean_probability(0.3, 0.5), 0.0);
        assert_eq!(clean_probability(0.5, 0.5), 0.0);
    }

    #[test]
    fn saturated_prior_passes_p_through() {
        assert_eq!(clean_probability(0.7, 1.0), 0.7);
        assert_eq!(clean_probability(-0.1, 1.0), 0.0);
    }

    proptest! {
        #[test]
        fn stays_in_unit_interval(p in 0.0f64..=1.0, q in 0.0f64..=1.0) {
            let v = clean_probability(p, q);
            prop_assert!((0.0..=1.0).contains(&v));
        }

        #[test]
        fn zero_when_already_achieved(p in 0.0f64..=1.0, frac in 0.0f64..1.0) {
            // q in [p, 1): nothing left to impose
            let q = p + (1.0 - p) * frac;
            prop_assume!(q < 1.0);
            prop_assert_eq!(clean_probability(p, q), 0.0);
        }
    }
}
