//! FISH distance targeting.
//!
//! The input carries, per probe (radial) and per pair, a target distance
//! distribution over the population: an array of expected distances, sorted
//! ascending. Assignment matches the ordered statistics of the targets to
//! the ordered statistics of the current achievements: each structure gets
//! the target with the same rank as its current distance, which preserves
//! the population distribution while minimizing movement.

use std::path::Path;

use ndarray::Array2;

use chromoplex_common::datafile::{DataFileReader, DataFileWriter};
use chromoplex_common::{Error, Result};
use chromoplex_store::PopulationFile;

use crate::matrix::{from_i64, to_i64};

/// FISH input: probes/pairs and their sorted target distributions, each of
/// length equal to the population size.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FishInput {
    pub probes: Vec<usize>,
    pub pairs: Vec<(usize, usize)>,
    pub radial_min: Option<Array2<f64>>,
    pub radial_max: Option<Array2<f64>>,
    pub pair_min: Option<Array2<f64>>,
    pub pair_max: Option<Array2<f64>>,
}

impl FishInput {
    /// Targets must have one entry per structure; anything else is a hard
    /// precondition failure, never silently truncated or recycled.
    pub fn validate(&self, n_struct: usize) -> Result<()> {
        let check = |name: &str, arr: &Option<Array2<f64>>, rows: usize| -> Result<()> {
            if let Some(arr) = arr {
                if arr.nrows() != rows || arr.ncols() != n_struct {
                    return Err(Error::Assignment(format!(
                        "FISH {} has shape ({}, {}), expected ({}, {})",
                        name,
                        arr.nrows(),
                        arr.ncols(),
                        rows,
                        n_struct
                    )));
                }
            }
            Ok(())
        };
        check("radial_min", &self.radial_min, self.probes.len())?;
        check("radial_max", &self.radial_max, self.probes.len())?;
        check("pair_min", &self.pair_min, self.pairs.len())?;
        check("pair_max", &self.pair_max, self.pairs.len())?;
        Ok(())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut w = DataFileWriter::new();
        w.put_i64("probes", &to_i64(&self.probes), &[self.probes.len() as u64]);
        let flat_pairs: Vec<i64> =
            self.pairs.iter().flat_map(|&(i, j)| [i as i64, j as i64]).collect();
        w.put_i64("pairs", &flat_pairs, &[self.pairs.len() as u64, 2]);
        let put = |w: &mut DataFileWriter, name: &str, arr: &Option<Array2<f64>>| {
            if let Some(arr) = arr {
                let flat: Vec<f64> = arr.iter().copied().collect();
                w.put_f64(name, &flat, &[arr.nrows() as u64, arr.ncols() as u64]);
            }
        };
        put(&mut w, "radial_min", &self.radial_min);
        put(&mut w, "radial_max", &self.radial_max);
        put(&mut w, "pair_min", &self.pair_min);
        put(&mut w, "pair_max", &self.pair_max);
        w.write_to(path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut r = DataFileReader::open(path)?;
        let probes =
            if r.has_dataset("probes") { from_i64(&r.read_i64("probes")?)? } else { Vec::new() };
        let pairs = if r.has_dataset("pairs") {
            let flat = r.read_i64("pairs")?;
            if flat.len() % 2 != 0 {
                return Err(Error::Assignment("FISH pairs dataset is ragged".into()));
            }
            flat.chunks_exact(2).map(|c| (c[0] as usize, c[1] as usize)).collect()
        } else {
            Vec::new()
        };
        let get = |r: &mut DataFileReader, name: &str| -> Result<Option<Array2<f64>>> {
            if !r.has_dataset(name) {
                return Ok(None);
            }
            let shape = r.shape(name)?;
            let data = r.read_f64(name)?;
            Array2::from_shape_vec((shape[0] as usize, shape[1] as usize), data)
                .map(Some)
                .map_err(|e| Error::DataFormat(e.to_string()))
        };
        Ok(Self {
            probes,
            pairs,
            radial_min: get(&mut r, "radial_min")?,
            radial_max: get(&mut r, "radial_max")?,
            pair_min: get(&mut r, "pair_min")?,
            pair_max: get(&mut r, "pair_max")?,
        })
    }
}

/// Rank of each element within the slice (argsort of argsort).
fn ranks(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).expect("finite distances"));
    let mut rank = vec![0usize; values.len()];
    for (r, &i) in order.iter().enumerate() {
        rank[i] = r;
    }
    rank
}

/// Match sorted targets to the current per-structure values: structure `s`
/// receives the target with the rank of its current value.
pub fn match_targets(current: &[f64], sorted_targets: &[f64]) -> Vec<f64> {
    let rank = ranks(current);
    rank.into_iter().map(|r| sorted_targets[r]).collect()
}

/// Per-structure min and max radial distance over the copies of a locus.
pub fn radial_min_max(pop: &mut PopulationFile, locus: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    let copies = pop.index().copies(locus).to_vec();
    let nstruct = pop.nstruct();
    let mut min = vec![f64::INFINITY; nstruct];
    let mut max = vec![f64::NEG_INFINITY; nstruct];
    for &bead in &copies {
        let crd = pop.get_bead_crd(bead)?;
        for s in 0..nstruct {
            let r = (crd[[s, 0]].powi(2) + crd[[s, 1]].powi(2) + crd[[s, 2]].powi(2)).sqrt();
            min[s] = min[s].min(r);
            max[s] = max[s].max(r);
        }
    }
    Ok((min, max))
}

/// Per-structure min and max distance over all copy combinations of a
/// locus pair.
pub fn pair_min_max(
    pop: &mut PopulationFile,
    locus_i: usize,
    locus_j: usize,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let ii = pop.index().copies(locus_i).to_vec();
    let jj = pop.index().copies(locus_j).to_vec();
    let nstruct = pop.nstruct();
    let slabs_i: Vec<_> = ii.iter().map(|&b| pop.get_bead_crd(b)).collect::<Result<_>>()?;
    let slabs_j: Vec<_> = jj.iter().map(|&b| pop.get_bead_crd(b)).collect::<Result<_>>()?;

    let mut min = vec![f64::INFINITY; nstruct];
    let mut max = vec![f64::NEG_INFINITY; nstruct];
    for a in &slabs_i {
        for b in &slabs_j {
            for s in 0..nstruct {
                let d = ((a[[s, 0]] - b[[s, 0]]).powi(2)
                    + (a[[s, 1]] - b[[s, 1]]).powi(2)
                    + (a[[s, 2]] - b[[s, 2]]).powi(2))
                .sqrt();
                min[s] = min[s].min(d);
                max[s] = max[s].max(d);
            }
        }
    }
    Ok((min, max))
}

/// The assignment artifact: per-structure targets, same datasets as the
/// input but re-ordered to match each structure's rank.
pub type FishAssignment = FishInput;

#[cfg(test)]
mod tests {
    use super::*;
    use chromoplex_common::{Bead, Genome, GenomeIndex};
    use chromoplex_store::Layout;
    use ndarray::{array, Array3};

    #[test]
    fn rank_matching_preserves_the_target_distribution() {
        let current = vec![5.0, 1.0, 3.0];
        let targets = vec![10.0, 20.0, 30.0];
        let assigned = match_targets(&current, &targets);
        // the largest current distance gets the largest target
        assert_eq!(assigned, vec![30.0, 10.0, 20.0]);
        let mut sorted = assigned.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(sorted, targets);
    }

    #[test]
    fn validation_rejects_target_length_mismatch() {
        let input = FishInput {
            probes: vec![0],
            radial_min: Some(array![[100.0, 200.0]]),
            ..Default::default()
        };
        assert!(input.validate(2).is_ok());
        assert!(input.validate(3).is_err());
    }

    #[test]
    fn roundtrip_with_partial_datasets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fish.cpxd");
        let input = FishInput {
            probes: vec![2, 5],
            pairs: vec![(2, 5)],
            radial_min: Some(array![[100.0, 150.0], [80.0, 90.0]]),
            pair_max: Some(array![[700.0, 800.0]]),
            ..Default::default()
        };
        input.write(&path).unwrap();
        let back = FishInput::read(&path).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn min_max_distances_over_copies() {
        let dir = tempfile::tempdir().unwrap();
        let beads = vec![
            Bead { id: 0, chrom: 0, start: 0, end: 100, copy: 0, radius: 10.0 },
            Bead { id: 1, chrom: 0, start: 0, end: 100, copy: 1, radius: 10.0 },
        ];
        let index = GenomeIndex::new(&beads).unwrap();
        let path = dir.path().join("fish.cps");
        let mut pop = PopulationFile::create(
            &path,
            &index,
            &Genome::default(),
            &[10.0; 2],
            1,
            "{}",
            Layout::BeadMajor,
        )
        .unwrap();
        let mut crd = Array3::zeros((2, 1, 3));
        crd[[0, 0, 0]] = 300.0;
        crd[[1, 0, 1]] = 500.0;
        pop.set_coordinates(&crd).unwrap();

        let (min, max) = radial_min_max(&mut pop, 0).unwrap();
        assert_eq!(min, vec![300.0]);
        assert_eq!(max, vec![500.0]);
    }
}
