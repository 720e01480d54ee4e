//! Per-structure model: particle list plus restraint list.

use std::collections::BTreeMap;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::particle::{Particle, ParticleKind};
use crate::restraint::Restraint;

pub const HISTOGRAM_BINS: usize = 100;

/// Violation bookkeeping for one restraint origin.
///
/// The histogram covers ratios in [0, 1] in `HISTOGRAM_BINS` bins plus one
/// overflow bin for ratios above 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationStats {
    pub imposed: u64,
    pub violated: u64,
    pub energy: f64,
    pub histogram: Vec<u64>,
}

impl Default for ViolationStats {
    fn default() -> Self {
        Self { imposed: 0, violated: 0, energy: 0.0, histogram: vec![0; HISTOGRAM_BINS + 1] }
    }
}

impl ViolationStats {
    pub fn record(&mut self, ratio: f64, energy: f64, tolerance: f64) {
        self.imposed += 1;
        self.energy += energy;
        if ratio > tolerance {
            self.violated += 1;
            let bin = if ratio >= 1.0 {
                HISTOGRAM_BINS
            } else {
                ((ratio * HISTOGRAM_BINS as f64) as usize).min(HISTOGRAM_BINS - 1)
            };
            self.histogram[bin] += 1;
        }
    }

    pub fn merge(&mut self, other: &ViolationStats) {
        self.imposed += other.imposed;
        self.violated += other.violated;
        self.energy += other.energy;
        for (a, b) in self.histogram.iter_mut().zip(&other.histogram) {
            *a += b;
        }
    }
}

/// Violations of one structure, keyed by restraint origin label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViolationSummary {
    pub by_origin: BTreeMap<String, ViolationStats>,
}

impl ViolationSummary {
    pub fn total_imposed(&self) -> u64 {
        self.by_origin.values().map(|s| s.imposed).sum()
    }

    pub fn total_violated(&self) -> u64 {
        self.by_origin.values().map(|s| s.violated).sum()
    }

    pub fn merge(&mut self, other: &ViolationSummary) {
        for (k, v) in &other.by_origin {
            self.by_origin.entry(k.clone()).or_default().merge(v);
        }
    }
}

/// Modeling target: all information the kernel needs for one structure.
#[derive(Debug, Default)]
pub struct Model {
    pub particles: Vec<Particle>,
    pub restraints: Vec<Restraint>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_particle(&mut self, pos: [f64; 3], radius: f64, kind: ParticleKind, chain: u32) -> usize {
        self.particles.push(Particle { pos, radius, kind, chain });
        self.particles.len() - 1
    }

    pub fn add_restraint(&mut self, r: Restraint) -> usize {
        self.restraints.push(r);
        self.restraints.len() - 1
    }

    pub fn n_normal(&self) -> usize {
        self.particles.iter().filter(|p| p.kind == ParticleKind::Normal).count()
    }

    /// Indices of the normal (genomic) particles.
    pub fn normal_particles(&self) -> Vec<usize> {
        self.particles
            .iter()
            .enumerate()
            .filter(|(_, p)| p.kind == ParticleKind::Normal)
            .map(|(i, _)| i)
            .collect()
    }

    /// Coordinates of normal particles as an (n, 3) array. The normal
    /// particles are always the leading block, so this matches the bead
    /// order of the population.
    pub fn coordinates(&self) -> Array2<f64> {
        let normals: Vec<&Particle> =
            self.particles.iter().filter(|p| p.kind == ParticleKind::Normal).collect();
        let mut arr = Array2::zeros((normals.len(), 3));
        for (i, p) in normals.iter().enumerate() {
            arr[[i, 0]] = p.pos[0];
            arr[[i, 1]] = p.pos[1];
            arr[[i, 2]] = p.pos[2];
        }
        arr
    }

    /// Evaluate violations of all monitored restraints.
    pub fn evaluate(&self, tolerance: f64) -> ViolationSummary {
        let mut summary = ViolationSummary::default();
        for r in &self.restraints {
            let origin = r.origin();
            if !origin.is_monitored() {
                continue;
            }
            let ratio = r.violation_ratio(&self.particles);
            let energy = r.score(&self.particles);
            summary
                .by_origin
                .entry(origin.label().to_string())
                .or_default()
                .record(ratio, energy, tolerance);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restraint::RestraintOrigin;

    #[test]
    fn evaluate_counts_only_monitored_origins() {
        let mut m = Model::new();
        let a = m.add_particle([0.0; 3], 1.0, ParticleKind::Normal, 0);
        let b = m.add_particle([10.0, 0.0, 0.0], 1.0, ParticleKind::Normal, 0);
        m.add_restraint(Restraint::ExcludedVolume { beads: vec![a, b], k: 1.0 });
        m.add_restraint(Restraint::HarmonicUpperBound {
            i: a,
            j: b,
            dist: 4.0,
            k: 1.0,
            origin: RestraintOrigin::Polymer,
        });
        m.add_restraint(Restraint::HarmonicUpperBound {
            i: a,
            j: b,
            dist: 20.0,
            k: 1.0,
            origin: RestraintOrigin::HiC,
        });

        let summary = m.evaluate(0.05);
        assert_eq!(summary.total_imposed(), 2);
        assert_eq!(summary.total_violated(), 1);
        assert!(summary.by_origin.contains_key("polymer"));
        assert!(!summary.by_origin.contains_key("steric"));
    }

    #[test]
    fn violation_ratio_within_tolerance_not_counted() {
        let mut m = Model::new();
        let a = m.add_particle([0.0; 3], 1.0, ParticleKind::Normal, 0);
        let b = m.add_particle([4.08, 0.0, 0.0], 1.0, ParticleKind::Normal, 0);
        m.add_restraint(Restraint::HarmonicUpperBound {
            i: a,
            j: b,
            dist: 4.0,
            k: 1.0,
            origin: RestraintOrigin::HiC,
        });
        // ratio = 0.08/4 = 0.02, below the 0.05 tolerance
        let summary = m.evaluate(0.05);
        assert_eq!(summary.total_imposed(), 1);
        assert_eq!(summary.total_violated(), 0);
    }
}
