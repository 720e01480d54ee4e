//! Lamina-DamID activation distances.
//!
//! A locus with DamID signal above sigma should touch the nuclear envelope
//! in a matching fraction of the population. The radial level of a bead is
//! its normalized squared distance to the envelope shrunk by the contact
//! range and the bead radius; levels >= 1 count as lamina contacts.

use std::path::Path;

use chromoplex_common::datafile::{DataFileReader, DataFileWriter};
use chromoplex_common::{Error, Result};
use chromoplex_config::EnvelopeConfig;
use chromoplex_store::PopulationFile;

use crate::clean_probability;
use crate::matrix::{from_i64, to_i64};

/// Activation level reported when no new contacts are needed; far beyond
/// any reachable radial level, so it never activates.
pub const INACTIVE_LEVEL: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DamidRow {
    pub bead: usize,
    /// Radial activation level; the bead is pulled to the envelope when its
    /// current level reaches this value.
    pub dist: f64,
    pub prob: f64,
}

/// Normalized squared radial level of a position against the shrunk
/// envelope semiaxes minus the bead radius.
pub fn radial_level_sq(
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
    s
}

/// Compute the DamID activation row set for one haploid locus.
pub fn compute_damid_actdist(
    pop: &mut PopulationFile,
    locus: usize,
    pwish: f64,
    plast: f64,
    contact_range: f64,
    env: &EnvelopeConfig,
) -> Result<Vec<DamidRow>> {
    let index = pop.index().clone();
    let nstruct = pop.nstruct();
    let copies = index.copies(locus).to_vec();
    let radius = pop.radii()[copies[0]];

    let mut levels = Vec::with_capacity(copies.len() * nstruct);
    for &bead in &copies {
        let crd = pop.get_bead_crd(bead)?;
        for s in 0..nstruct {
            levels.push(radial_level_sq(
                [crd[[s, 0]], crd[[s, 1]], crd[[s, 2]]],
                radius,
                env,
                contact_range,
            ));
        }
    }
    // sorted descending: contacts first
    levels.sort_by(|a, b| b.partial_cmp(a).expect("finite levels"));
    let contacts = levels.iter().take_while(|&&v| v >= 1.0).count();
    let p_now = contacts as f64 / levels.len() as f64;

    let t = clean_probability(p_now, plast);
    let p_new = clean_probability(pwish, t);

    let activation = if p_new > 0.0 {
        let o = ((levels.len() as f64 * p_new).round() as usize).min(levels.len() - 1);
        levels[o].sqrt()
    } else {
        INACTIVE_LEVEL
    };
    Ok(copies.iter().map(|&bead| DamidRow { bead, dist: activation, prob: p_new }).collect())
}

pub fn write_damid_actdist(path: &Path, rows: &[DamidRow]) -> Result<()> {
    let mut w = DataFileWriter::new();
    let loc: Vec<usize> = rows.iter().map(|r| r.bead).collect();
    let dist: Vec<f64> = rows.iter().map(|r| r.dist).collect();
    let prob: Vec<f64> = rows.iter().map(|r| r.prob).collect();
    w.put_i64("loc", &to_i64(&loc), &[loc.len() as u64]);
    w.put_f64("dist", &dist, &[dist.len() as u64]);
    w.put_f64("prob", &prob, &[prob.len() as u64]);
    w.write_to(path)
}

pub fn read_damid_actdist(path: &Path) -> Result<Vec<DamidRow>> {
    let mut r = DataFileReader::open(path)?;
    let loc = from_i64(&r.read_i64("loc")?)?;
    let dist = r.read_f64("dist")?;
    let prob = r.read_f64("prob")?;
    if loc.len() != dist.len() || loc.len() != prob.len() {
        return Err(Error::Assignment("damid activation table has ragged columns".into()));
    }
    Ok(loc
        .into_iter()
        .zip(dist)
        .zip(prob)
        .map(|((bead, dist), prob)| DamidRow { bead, dist, prob })
        .collect())
}

/// Previous corrected probabilities keyed by bead id; empty on the first
/// iteration.
pub fn last_probabilities(path: Option<&Path>) -> Result<std::collections::HashMap<usize, f64>> {
    match path {
        None => Ok(Default::default()),
        Some(path) => {
            let rows = read_damid_actdist(path)?;
            Ok(rows.into_iter().map(|r| (r.bead, r.prob)).collect())
        }
    }
}

/// Plain-text DamID signal profile, one value per haploid locus.
pub fn read_profile(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read DamID profile {}: {}", path.display(), e)))?;
    let mut values = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        values.push(line.parse::<f64>().map_err(|e| {
            Error::Config(format!("DamID profile line {}: {}", lineno + 1, e))
        })?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chromoplex_common::{Bead, Genome, GenomeIndex};
    use chromoplex_store::Layout;
    use ndarray::Array3;

    fn population(dir: &Path, positions: &[[f64; 3]]) -> PopulationFile {
        // one diploid locus, one structure per test simplicity... here:
        // 2 copies x nstruct structures laid out from `positions`
        let beads = vec![
            Bead { id: 0, chrom: 0, start: 0, end: 100, copy: 0, radius: 50.0 },
            Bead { id: 1, chrom: 0, start: 0, end: 100, copy: 1, radius: 50.0 },
        ];
        let index = GenomeIndex::new(&beads).unwrap();
        let nstruct = positions.len() / 2;
        let path = dir.join("damid.cps");
        let mut pop = PopulationFile::create(
            &path,
            &index,
            &Genome::default(),
            &[50.0; 2],
            nstruct,
            "{}",
            Layout::BeadMajor,
        )
        .unwrap();
        let mut crd = Array3::zeros((2, nstruct, 3));
        for (k, p) in positions.iter().enumerate() {
            let (b, s) = (k % 2, k / 2);
            for d in 0..3 {
                crd[[b, s, d]] = p[d];
            }
        }
        pop.set_coordinates(&crd).unwrap();
        pop
    }

    fn env(radius: f64) -> EnvelopeConfig {
        EnvelopeConfig { nucleus_radius: radius, ..Default::default() }
    }

    #[test]
    fn all_copies_of_the_locus_share_one_activation() {
        let dir = tempfile::tempdir().unwrap();
        // shrunk radius: 1000*(1-0.05) - 50 = 900
        // structure 0: copy 0 at the envelope, copy 1 at the center
        // structure 1: both at half radius
        let mut pop = population(
            dir.path(),
            &[[905.0, 0.0, 0.0], [0.0, 0.0, 0.0], [450.0, 0.0, 0.0], [0.0, 450.0, 0.0]],
        );
        let rows = compute_damid_actdist(&mut pop, 0, 0.75, 0.0, 0.05, &env(1000.0)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bead, 0);
        assert_eq!(rows[1].bead, 1);
        assert_eq!(rows[0].dist, rows[1].dist);
        // p_now = 1/4, p_new = clean(0.75, 0.25) = 2/3
        assert!((rows[0].prob - 2.0 / 3.0).abs() < 1e-9);
        // order statistic at index round(4 * 2/3) = 3 of the descending
        // levels [1.01, 0.25, 0.25, 0]: every copy activates
        assert!((rows[0].dist - 0.0).abs() < 1e-12);
    }

    #[test]
    fn satisfied_locus_is_inactive() {
        let dir = tempfile::tempdir().unwrap();
        // three of four copy cells already touch the envelope
        let mut pop = population(
            dir.path(),
            &[[905.0, 0.0, 0.0], [0.0, 905.0, 0.0], [905.0, 0.0, 0.0], [0.0, 0.0, 0.0]],
        );
        let rows = compute_damid_actdist(&mut pop, 0, 0.5, 0.0, 0.05, &env(1000.0)).unwrap();
        // p_now = 0.75 >= wish: p_new = 0 and the activation level is
        // unreachable
        assert_eq!(rows[0].prob, 0.0);
        assert_eq!(rows[0].dist, INACTIVE_LEVEL);
    }

    #[test]
    fn profile_parsing_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.txt");
        std::fs::write(&path, "# header\n0.5\n\n0.125\n").unwrap();
        assert_eq!(read_profile(&path).unwrap(), vec![0.5, 0.125]);
    }

    #[test]
    fn actdist_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("damid.cpxd");
        let rows =
            vec![DamidRow { bead: 3, dist: 0.97, prob: 0.5 }, DamidRow { bead: 7, dist: 2.0, prob: 0.0 }];
        write_damid_actdist(&path, &rows).unwrap();
        assert_eq!(read_damid_actdist(&path).unwrap(), rows);
        assert_eq!(last_probabilities(Some(&path)).unwrap()[&3], 0.5);
    }
}
