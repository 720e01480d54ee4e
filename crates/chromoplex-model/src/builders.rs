//! Restraint builders: translate the genome index, configuration and
//! assignment rows into the restraint list of one structure's model.

use std::sync::Arc;

use ndarray::Array2;

use chromoplex_common::{Error, GenomeIndex, Result};
use chromoplex_config::{BodyConfig, EnvelopeConfig, EnvelopeShape, PolymerBondsStyle, PolymerConfig};

use crate::model::Model;
use crate::particle::ParticleKind;
use crate::restraint::{Restraint, RestraintOrigin};
use crate::voxmap::VoxelMap;

/// Consecutive-contact probabilities below this floor (or above 1) are
/// treated as unreliable and clamped.
const MIN_CONSECUTIVE: f64 = 0.5;

/// Populate the model with the genomic beads of one structure.
pub fn add_beads(model: &mut Model, crd: &Array2<f64>, radii: &[f64], index: &GenomeIndex) {
    let chains = index.chain();
    for i in 0..index.len() {
        model.add_particle(
            [crd[[i, 0]], crd[[i, 1]], crd[[i, 2]]],
            radii[i],
            ParticleKind::Normal,
            chains[i],
        );
    }
}

/// Soft-core excluded volume over all genomic beads.
pub fn add_excluded_volume(model: &mut Model, evfactor: f64) {
    let beads = model.normal_particles();
    model.add_restraint(Restraint::ExcludedVolume { beads, k: evfactor });
}

/// Nuclear envelope confinement for the configured shape.
pub fn add_envelope(
    model: &mut Model,
    env: &EnvelopeConfig,
    map: Option<Arc<VoxelMap>>,
) -> Result<()> {
    let beads = model.normal_particles();
    match env.nucleus_shape {
        EnvelopeShape::Sphere | EnvelopeShape::Ellipsoid => {
            let semiaxes = env.semiaxes();
            let scale = 0.1 * (semiaxes[0] + semiaxes[1] + semiaxes[2]) / 3.0;
            model.add_restraint(Restraint::EllipticEnvelope {
                beads,
                semiaxes,
                k: env.nucleus_kspring,
                scale,
                origin: RestraintOrigin::Envelope,
            });
        }
        EnvelopeShape::ExpMap => {
            let map = map.ok_or_else(|| {
                Error::Config("exp_map envelope requires a loaded voxel map".into())
            })?;
            model.add_restraint(Restraint::VolumetricEnvelope {
                beads,
                map,
                k: env.nucleus_kspring,
                origin: RestraintOrigin::Envelope,
            });
        }
    }
    Ok(())
}

/// Bond distance for a consecutive bead pair under the `hic` bond style.
///
/// `f` is the consecutive contact probability; the distance interpolates
/// between the plain contact distance (f = 1) and larger separations for
/// rarely-touching neighbors.
fn consecutive_bond_distance(d0: f64, d1: f64, f: f64) -> f64 {
    let f = if !(MIN_CONSECUTIVE..=1.0).contains(&f) { MIN_CONSECUTIVE } else { f };
    ((d1.powi(3) + (f - 1.0) * d0.powi(3)) / f).cbrt()
}

/// Harmonic bonds between consecutive beads of the same chromosome copy.
pub fn add_polymer_bonds(
    model: &mut Model,
    index: &GenomeIndex,
    cfg: &PolymerConfig,
    contact_probabilities: Option<&[f64]>,
) -> usize {
    if cfg.polymer_bonds_style == PolymerBondsStyle::None {
        return 0;
    }
    let chains = index.chain();
    let mut count = 0;
    for i in 0..index.len().saturating_sub(1) {
        if chains[i] != chains[i + 1] {
            continue;
        }
        let d0 = model.particles[i].radius + model.particles[i + 1].radius;
        let d1 = cfg.contact_range * d0;
        let dij = match cfg.polymer_bonds_style {
            PolymerBondsStyle::Simple => d1,
            PolymerBondsStyle::Hic => {
                let f = contact_probabilities.map(|cp| cp[i]).unwrap_or(1.0);
                consecutive_bond_distance(d0, d1, f)
            }
            PolymerBondsStyle::None => unreachable!(),
        };
        model.add_restraint(Restraint::HarmonicUpperBound {
            i,
            j: i + 1,
            dist: dij,
            k: cfg.polymer_kspring,
            origin: RestraintOrigin::Polymer,
        });
        count += 1;
    }
    count
}

/// Soft exclusion from configured nuclear bodies.
pub fn add_nuclear_bodies(model: &mut Model, bodies: &[BodyConfig]) {
    for body in bodies {
        let beads = model.normal_particles();
        model.add_restraint(Restraint::BodyExcludedVolume {
            beads,
            center: body.center,
            radius: body.radius,
            k: body.kspring,
        });
    }
}

/// Hi-C activation rows: impose an upper bound on each pair whose current
/// distance is within the activation distance.
pub fn add_hic_bonds(
    model: &mut Model,
    rows: impl IntoIterator<Item = (usize, usize, f64)>,
    contact_range: f64,
    k: f64,
) -> usize {
    let mut count = 0;
    for (i, j, d_act) in rows {
        let pi = &model.particles[i];
        let pj = &model.particles[j];
        if pi.distance(pj) <= d_act {
            let dist = contact_range * (pi.radius + pj.radius);
            model.add_restraint(Restraint::HarmonicUpperBound {
                i,
                j,
                dist,
                k,
                origin: RestraintOrigin::HiC,
            });
            count += 1;
        }
    }
    count
}

/// Normalized radial level of a position against the envelope shrunk by
/// `1 - contact_range` and by the bead radius; 1.0 on the shrunk surface.
pub fn damid_radial_level(
    pos: [f64; 3],
    radius: f64,
    env: &EnvelopeConfig,
    contact_range: f64,
) -> f64 {
    let semiaxes = env.semiaxes();
    let mut s = 0.0;
    for d in 0..3 {
        let ax = (semiaxes[d] * (1.0 - contact_range) - radius).max(f64::EPSILON);
        s += (pos[d] / ax).powi(2);
    }
    s.sqrt()
}

/// DamID activation rows: beads whose radial level reaches the activation
/// value are pushed against the envelope from inside (repulsive shrunk
/// ellipsoid).
pub fn add_damid_restraint(
    model: &mut Model,
    rows: impl IntoIterator<Item = (usize, f64)>,
    contact_range: f64,
    env: &EnvelopeConfig,
    k: f64,
) -> usize {
    let affected: Vec<usize> = rows
        .into_iter()
        .filter(|&(i, d_act)| {
            let p = &model.particles[i];
            damid_radial_level(p.pos, p.radius, env, contact_range) >= d_act
        })
        .map(|(i, _)| i)
        .collect();
    let count = affected.len();
    if count == 0 {
        return 0;
    }
    let semiaxes = env.semiaxes();
    let shrunk = [
        semiaxes[0] * (1.0 - contact_range),
        semiaxes[1] * (1.0 - contact_range),
        semiaxes[2] * (1.0 - contact_range),
    ];
    let scale = 0.1 * (shrunk[0] + shrunk[1] + shrunk[2]) / 3.0;
    model.add_restraint(Restraint::EllipticEnvelope {
        beads: affected,
        semiaxes: shrunk,
        k: -k,
        scale,
        origin: RestraintOrigin::DamID,
    });
    count
}

/// Target distance from a cluster bead to its centroid: beads packed into a
/// sphere at the configured volume fraction.
pub fn sprite_cluster_size(radii: &[f64], volume_fraction: f64) -> f64 {
    let vol: f64 = radii.iter().map(|r| r.powi(3)).sum();
    (vol / volume_fraction).cbrt()
}

/// SPRITE cluster: a dynamic centroid particle pulled together with the
/// participating beads.
pub fn add_sprite_cluster(
    model: &mut Model,
    beads: &[usize],
    volume_fraction: f64,
    k: f64,
) -> usize {
    if beads.is_empty() {
        return 0;
    }
    let mut center = [0.0; 3];
    let mut radii = Vec::with_capacity(beads.len());
    for &b in beads {
        let p = &model.particles[b];
        center[0] += p.pos[0];
        center[1] += p.pos[1];
        center[2] += p.pos[2];
        radii.push(p.radius);
    }
    for c in center.iter_mut() {
        *c /= beads.len() as f64;
    }
    let csize = sprite_cluster_size(&radii, volume_fraction);
    let centroid = model.add_particle(center, 0.0, ParticleKind::DynamicCentroid, u32::MAX);

    let mut count = 0;
    for &b in beads {
        let dist = (csize - model.particles[b].radius).max(0.0);
        model.add_restraint(Restraint::HarmonicUpperBound {
            i: b,
            j: centroid,
            dist,
            k,
            origin: RestraintOrigin::Sprite,
        });
        count += 1;
    }
    count
}

/// Per-structure FISH targets, one value per probe or pair.
#[derive(Debug, Clone, Default)]
pub struct FishStructTargets {
    pub probes: Vec<usize>,
    pub pairs: Vec<(usize, usize)>,
    pub radial_min: Option<Vec<f64>>,
    pub radial_max: Option<Vec<f64>>,
    pub pair_min: Option<Vec<f64>>,
    pub pair_max: Option<Vec<f64>>,
}

fn sort_copies_radially(model: &Model, copies: &[usize]) -> Vec<usize> {
    let mut ids = copies.to_vec();
    ids.sort_by(|&a, &b| {
        model.particles[a]
            .norm()
            .partial_cmp(&model.particles[b].norm())
            .expect("finite coordinates")
    });
    ids
}

fn sort_pairs_by_distance(model: &Model, ii: &[usize], jj: &[usize]) -> Vec<(usize, usize)> {
    let mut pairs: Vec<(usize, usize)> = Vec::with_capacity(ii.len() * jj.len());
    for &m in ii {
        for &n in jj {
            pairs.push((m, n));
        }
    }
    pairs.sort_by(|a, b| {
        let da = model.particles[a.0].distance(&model.particles[a.1]);
        let db = model.particles[b.0].distance(&model.particles[b.1]);
        da.partial_cmp(&db).expect("finite coordinates")
    });
    pairs
}

/// FISH restraints for one structure. `rtype` selects the imposed bounds:
/// `r`/`R` radial min/max, `p`/`P` pair min/max.
pub fn add_fish_restraints(
    model: &mut Model,
    index: &GenomeIndex,
    targets: &FishStructTargets,
    rtype: &str,
    tol: f64,
    k: f64,
) -> Result<usize> {
    let min_radial = rtype.contains('r');
    let max_radial = rtype.contains('R');
    let min_pair = rtype.contains('p');
    let max_pair = rtype.contains('P');
    let mut count = 0;

    let center = if min_radial || max_radial {
        Some(model.add_particle([0.0; 3], 0.0, ParticleKind::StaticDummy, u32::MAX))
    } else {
        None
    };

    let mut radial = |model: &mut Model, locus: usize, target: f64, farthest: bool| {
        let sorted = sort_copies_radially(model, index.copies(locus));
        let particle = if farthest { *sorted.last().unwrap() } else { sorted[0] };
        let center = center.unwrap();
        model.add_restraint(Restraint::HarmonicLowerBound {
            i: center,
            j: particle,
            dist: (target - tol).max(0.0),
            k,
            origin: RestraintOrigin::FishRadial,
        });
        model.add_restraint(Restraint::HarmonicUpperBound {
            i: center,
            j: particle,
            dist: target + tol,
            k,
            origin: RestraintOrigin::FishRadial,
        });
        2
    };

    if min_radial {
        let values = targets
            .radial_min
            .as_ref()
            .ok_or_else(|| Error::Assignment("missing radial_min targets".into()))?;
        for (pk, &locus) in targets.probes.iter().enumerate() {
            count += radial(model, locus, values[pk], false);
        }
    }
    if max_radial {
        let values = targets
            .radial_max
            .as_ref()
            .ok_or_else(|| Error::Assignment("missing radial_max targets".into()))?;
        for (pk, &locus) in targets.probes.iter().enumerate() {
            count += radial(model, locus, values[pk], true);
        }
    }

    if min_pair {
        let values = targets
            .pair_min
            .as_ref()
            .ok_or_else(|| Error::Assignment("missing pair_min targets".into()))?;
        for (pk, &(li, lj)) in targets.pairs.iter().enumerate() {
            let target = values[pk];
            let sorted = sort_pairs_by_distance(model, index.copies(li), index.copies(lj));
            // no combination may come closer than the minimum target
            for &(m, n) in &sorted {
                model.add_restraint(Restraint::HarmonicLowerBound {
                    i: m,
                    j: n,
                    dist: (target - tol).max(0.0),
                    k,
                    origin: RestraintOrigin::FishPair,
                });
                count += 1;
            }
            // the closest combination realizes the minimum distance
            let (m, n) = sorted[0];
            model.add_restraint(Restraint::HarmonicUpperBound {
                i: m,
                j: n,
                dist: target + tol,
                k,
                origin: RestraintOrigin::FishPair,
            });
            count += 1;
        }
    }
    if max_pair {
        let values = targets
            .pair_max
            .as_ref()
            .ok_or_else(|| Error::Assignment("missing pair_max targets".into()))?;
        for (pk, &(li, lj)) in targets.pairs.iter().enumerate() {
            let target = values[pk];
            let sorted = sort_pairs_by_distance(model, index.copies(li), index.copies(lj));
            // no combination may stretch past the maximum target
            for &(m, n) in &sorted {
                model.add_restraint(Restraint::HarmonicUpperBound {
                    i: m,
                    j: n,
                    dist: target + tol,
                    k,
                    origin: RestraintOrigin::FishPair,
                });
                count += 1;
            }
            // the farthest combination realizes the maximum distance
            let (m, n) = *sorted.last().unwrap();
            model.add_restraint(Restraint::HarmonicLowerBound {
                i: m,
                j: n,
                dist: (target - tol).max(0.0),
                k,
                origin: RestraintOrigin::FishPair,
            });
            count += 1;
        }
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chromoplex_common::Bead;
    use ndarray::array;

    fn diploid_index() -> GenomeIndex {
        GenomeIndex::new(&[
            Bead { id: 0, chrom: 0, start: 0, end: 100, copy: 0, radius: 10.0 },
            Bead { id: 1, chrom: 0, start: 100, end: 200, copy: 0, radius: 10.0 },
            Bead { id: 2, chrom: 0, start: 0, end: 100, copy: 1, radius: 10.0 },
            Bead { id: 3, chrom: 0, start: 100, end: 200, copy: 1, radius: 10.0 },
        ])
        .unwrap()
    }

    fn model_with(crd: [[f64; 3]; 4]) -> (Model, GenomeIndex) {
        let index = diploid_index();
        let mut model = Model::new();
        let arr = array![
            [crd[0][0], crd[0][1], crd[0][2]],
            [crd[1][0], crd[1][1], crd[1][2]],
            [crd[2][0], crd[2][1], crd[2][2]],
            [crd[3][0], crd[3][1], crd[3][2]],
        ];
        add_beads(&mut model, &arr, &[10.0; 4], &index);
        (model, index)
    }

    #[test]
    fn polymer_bonds_skip_chain_breaks() {
        let (mut model, index) = model_with([[0.0; 3]; 4]);
        let n = add_polymer_bonds(&mut model, &index, &PolymerConfig::default(), None);
        // beads 0-1 and 2-3 are consecutive; 1-2 crosses copies
        assert_eq!(n, 2);
    }

    #[test]
    fn hic_style_bond_reduces_to_simple_at_full_probability() {
        let d0 = 20.0;
        let d1 = 40.0;
        assert!((consecutive_bond_distance(d0, d1, 1.0) - d1).abs() < 1e-12);
        // lower probability stretches the bond
        assert!(consecutive_bond_distance(d0, d1, 0.5) > d1);
        // out-of-range probabilities fall back to the floor
        assert_eq!(
            consecutive_bond_distance(d0, d1, 0.1),
            consecutive_bond_distance(d0, d1, 0.5)
        );
    }

    #[test]
    fn hic_rows_impose_only_within_activation_distance() {
        let (mut model, _) = model_with([
            [0.0, 0.0, 0.0],
            [100.0, 0.0, 0.0],
            [0.0, 500.0, 0.0],
            [400.0, 500.0, 0.0],
        ]);
        let n = add_hic_bonds(&mut model, vec![(0, 1, 150.0), (2, 3, 150.0)], 2.0, 1.0);
        assert_eq!(n, 1);
        match &model.restraints[0] {
            Restraint::HarmonicUpperBound { i, j, dist, .. } => {
                assert_eq!((*i, *j), (0, 1));
                assert!((dist - 40.0).abs() < 1e-12);
            }
            other => panic!("unexpected restraint {:?}", other),
        }
    }

    #[test]
    fn damid_selects_beads_beyond_activation() {
        let env = EnvelopeConfig { nucleus_radius: 1000.0, ..Default::default() };
        let (mut model, _) = model_with([
            [900.0, 0.0, 0.0],
            [10.0, 0.0, 0.0],
            [0.0, 920.0, 0.0],
            [0.0, 10.0, 0.0],
        ]);
        // activation level 0.9: beads 0 and 2 are near the envelope
        let rows = vec![(0, 0.9), (1, 0.9), (2, 0.9), (3, 0.9)];
        let n = add_damid_restraint(&mut model, rows, 0.05, &env, 1.0);
        assert_eq!(n, 2);
        match &model.restraints[0] {
            Restraint::EllipticEnvelope { beads, k, .. } => {
                assert_eq!(beads, &vec![0, 2]);
                assert!(*k < 0.0);
            }
            other => panic!("unexpected restraint {:?}", other),
        }
    }

    #[test]
    fn sprite_cluster_bonds_point_at_centroid() {
        let (mut model, _) = model_with([
            [0.0, 0.0, 0.0],
            [100.0, 0.0, 0.0],
            [0.0, 100.0, 0.0],
            [0.0, 0.0, 100.0],
        ]);
        let n = add_sprite_cluster(&mut model, &[0, 1, 2], 0.2, 1.0);
        assert_eq!(n, 3);
        let centroid = &model.particles[4];
        assert_eq!(centroid.kind, ParticleKind::DynamicCentroid);
        let csize = sprite_cluster_size(&[10.0, 10.0, 10.0], 0.2);
        match &model.restraints[0] {
            Restraint::HarmonicUpperBound { dist, .. } => {
                assert!((dist - (csize - 10.0)).abs() < 1e-9);
            }
            other => panic!("unexpected restraint {:?}", other),
        }
    }

    #[test]
    fn fish_radial_bounds_track_the_closest_copy() {
        let (mut model, index) = model_with([
            [300.0, 0.0, 0.0],
            [0.0, 0.0, 0.0],
            [700.0, 0.0, 0.0],
            [0.0, 0.0, 0.0],
        ]);
        let targets = FishStructTargets {
            probes: vec![0],
            radial_min: Some(vec![350.0]),
            ..Default::default()
        };
        let n = add_fish_restraints(&mut model, &index, &targets, "r", 10.0, 1.0).unwrap();
        assert_eq!(n, 2);
        // the closest copy (bead 0 at radius 300) is bounded to [340, 360]
        match &model.restraints[0] {
            Restraint::HarmonicLowerBound { j, dist, .. } => {
                assert_eq!(*j, 0);
                assert!((dist - 340.0).abs() < 1e-12);
            }
            other => panic!("unexpected restraint {:?}", other),
        }
    }

    #[test]
    fn fish_probe_with_zero_targets_is_a_noop() {
        let (mut model, index) = model_with([[0.0; 3]; 4]);
        let targets = FishStructTargets::default();
        let n = add_fish_restraints(&mut model, &index, &targets, "rRpP", 0.0, 1.0).unwrap();
        assert_eq!(n, 0);
    }
}
