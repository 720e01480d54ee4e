//! SPRITE cluster assignment.
//!
//! Candidate generation scores every structure by the radius of gyration of
//! the cluster beads, choosing per structure the copy combination with the
//! smallest Rg². The global reduce walks the clusters in random order and
//! draws the hosting structure from a Boltzmann distribution over the best
//! candidates, with an occupancy penalty that keeps the load near uniform.

use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;

use chromoplex_common::datafile::{DataFileReader, DataFileWriter};
use chromoplex_common::{Error, Result};
use chromoplex_store::PopulationFile;

use crate::matrix::{from_i64, to_i64};

/// Exhaustive copy-combination search is bounded; larger clusters fall back
/// to greedy centroid refinement.
const MAX_ENUMERATED_COMBINATIONS: usize = 4096;
const GREEDY_PASSES: usize = 3;

/// Clusters file: concatenated haploid locus ids with cluster boundaries.
#[derive(Debug, Clone, Default)]
pub struct ClustersFile {
    pub indptr: Vec<usize>,
    pub data: Vec<usize>,
}

impl ClustersFile {
    pub fn n_clusters(&self) -> usize {
        self.indptr.len().saturating_sub(1)
    }

    pub fn cluster(&self, i: usize) -> &[usize] {
        &self.data[self.indptr[i]..self.indptr[i + 1]]
    }

    pub fn from_clusters(clusters: &[Vec<usize>]) -> Self {
        let mut indptr = Vec::with_capacity(clusters.len() + 1);
        let mut data = Vec::new();
        indptr.push(0);
        for c in clusters {
            data.extend_from_slice(c);
            indptr.push(data.len());
        }
        Self { indptr, data }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut w = DataFileWriter::new();
        w.put_i64("indptr", &to_i64(&self.indptr), &[self.indptr.len() as u64]);
        w.put_i64("data", &to_i64(&self.data), &[self.data.len() as u64]);
        w.write_to(path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut r = DataFileReader::open(path)?;
        let indptr = from_i64(&r.read_i64("indptr")?)?;
        let data = from_i64(&r.read_i64("data")?)?;
        if indptr.is_empty() || *indptr.last().unwrap() != data.len() {
            return Err(Error::Assignment("malformed clusters file".into()));
        }
        for w in indptr.windows(2) {
            if w[1] < w[0] {
                return Err(Error::Assignment("clusters indptr is not monotone".into()));
            }
        }
        Ok(Self { indptr, data })
    }
}

/// Best candidate structures for one cluster, sorted by Rg² ascending.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClusterCandidates {
    pub rg2: Vec<f64>,
    pub structs: Vec<usize>,
    /// Chosen bead ids per candidate, one per cluster locus.
    pub picks: Vec<Vec<usize>>,
}

fn rg2_of(points: &[[f64; 3]]) -> f64 {
    let n = points.len() as f64;
    let mut c = [0.0f64; 3];
    for p in points {
        for d in 0..3 {
            c[d] += p[d];
        }
    }
    for v in c.iter_mut() {
        *v /= n;
    }
    let mut s = 0.0;
    for p in points {
        for d in 0..3 {
            s += (p[d] - c[d]).powi(2);
        }
    }
    s / n
}

/// Per-structure minimum-Rg² copy choice for one cluster.
fn best_combination(copy_positions: &[Vec<[f64; 3]>]) -> (f64, Vec<usize>) {
    let n_loci = copy_positions.len();
    let mut total: usize = 1;
    for copies in copy_positions {
        total = total.saturating_mul(copies.len());
        if total > MAX_ENUMERATED_COMBINATIONS {
            break;
        }
    }

    if total <= MAX_ENUMERATED_COMBINATIONS {
        // mixed-radix enumeration over per-locus copy choices
        let mut choice = vec![0usize; n_loci];
        let mut best = (f64::INFINITY, choice.clone());
        loop {
            let points: Vec<[f64; 3]> =
                choice.iter().enumerate().map(|(l, &c)| copy_positions[l][c]).collect();
            let rg2 = rg2_of(&points);
            if rg2 < best.0 {
                best = (rg2, choice.clone());
            }
            // increment
            let mut l = 0;
            loop {
                if l == n_loci {
                    return best;
                }
                choice[l] += 1;
                if choice[l] < copy_positions[l].len() {
                    break;
                }
                choice[l] = 0;
                l += 1;
            }
        }
    } else {
        // greedy refinement: repeatedly pick the copy nearest the centroid
        let mut choice = vec![0usize; n_loci];
        for _ in 0..GREEDY_PASSES {
            let points: Vec<[f64; 3]> =
                choice.iter().enumerate().map(|(l, &c)| copy_positions[l][c]).collect();
            let n = points.len() as f64;
            let mut centroid = [0.0; 3];
            for p in &points {
                for d in 0..3 {
                    centroid[d] += p[d] / n;
                }
            }
            let mut changed = false;
            for (l, copies) in copy_positions.iter().enumerate() {
                let mut best_c = choice[l];
                let mut best_d = f64::INFINITY;
                for (c, p) in copies.iter().enumerate() {
                    let d: f64 = (0..3).map(|d| (p[d] - centroid[d]).powi(2)).sum();
                    if d < best_d {
                        best_d = d;
                        best_c = c;
                    }
                }
                if best_c != choice[l] {
                    choice[l] = best_c;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        let points: Vec<[f64; 3]> =
            choice.iter().enumerate().map(|(l, &c)| copy_positions[l][c]).collect();
        (rg2_of(&points), choice)
    }
}

/// Generate the `keep_best` candidate structures for one cluster, or `None`
/// when the cluster spans too many chromosomes and is marked inactive.
pub fn cluster_candidates(
    pop: &mut PopulationFile,
    cluster: &[usize],
    keep_best: usize,
    max_chrom_in_cluster: usize,
) -> Result<Option<ClusterCandidates>> {
    if cluster.is_empty() {
        return Ok(None);
    }
    let index = pop.index().clone();
    let nstruct = pop.nstruct();

    let mut chroms: Vec<u32> = cluster.iter().map(|&l| index.locus_chrom(l)).collect();
    chroms.sort_unstable();
    chroms.dedup();
    if chroms.len() > max_chrom_in_cluster {
        return Ok(None);
    }

    // per locus, per copy: positions across all structures
    let mut slabs: Vec<Vec<ndarray::Array2<f64>>> = Vec::with_capacity(cluster.len());
    for &locus in cluster {
        let mut per_copy = Vec::new();
        for &bead in index.copies(locus) {
            per_copy.push(pop.get_bead_crd(bead)?);
        }
        slabs.push(per_copy);
    }

    // the combination search is independent per structure
    let per_struct: Vec<(f64, Vec<usize>)> = (0..nstruct)
        .into_par_iter()
        .map(|s| {
            let copy_positions: Vec<Vec<[f64; 3]>> = slabs
                .iter()
                .map(|per_copy| {
                    per_copy
                        .iter()
                        .map(|slab| [slab[[s, 0]], slab[[s, 1]], slab[[s, 2]]])
                        .collect()
                })
                .collect();
            let (best_rg2, choice) = best_combination(&copy_positions);
            let beads =
                choice.iter().enumerate().map(|(l, &c)| index.copies(cluster[l])[c]).collect();
            (best_rg2, beads)
        })
        .collect();
    let rg2: Vec<f64> = per_struct.iter().map(|(v, _)| *v).collect();
    let picks: Vec<Vec<usize>> = per_struct.into_iter().map(|(_, p)| p).collect();

    // keep the `keep_best` structures with smallest Rg²
    let mut order: Vec<usize> = (0..nstruct).collect();
    order.sort_by(|&a, &b| rg2[a].partial_cmp(&rg2[b]).expect("finite rg2"));
    order.truncate(keep_best.min(nstruct));

    Ok(Some(ClusterCandidates {
        rg2: order.iter().map(|&s| rg2[s]).collect(),
        structs: order.clone(),
        picks: order.iter().map(|&s| picks[s].clone()).collect(),
    }))
}

/// Final cluster-to-structure mapping with the chosen bead copies.
#[derive(Debug, Clone, PartialEq)]
pub struct SpriteAssignment {
    /// Hosting structure per cluster; -1 for inactive clusters.
    pub assignment: Vec<i64>,
    pub indptr: Vec<usize>,
    /// Concatenated chosen bead ids; -1 placeholders for inactive clusters.
    pub selected: Vec<i64>,
}

impl SpriteAssignment {
    pub fn selected_beads(&self, cluster: usize) -> &[i64] {
        &self.selected[self.indptr[cluster]..self.indptr[cluster + 1]]
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut w = DataFileWriter::new();
        w.put_i64("assignment", &self.assignment, &[self.assignment.len() as u64]);
        w.put_i64("indptr", &to_i64(&self.indptr), &[self.indptr.len() as u64]);
        w.put_i64("selected", &self.selected, &[self.selected.len() as u64]);
        w.write_to(path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut r = DataFileReader::open(path)?;
        let assignment = r.read_i64("assignment")?;
        let indptr = from_i64(&r.read_i64("indptr")?)?;
        let selected = r.read_i64("selected")?;
        if indptr.is_empty() || *indptr.last().unwrap() != selected.len() {
            return Err(Error::Assignment("malformed sprite assignment file".into()));
        }
        Ok(Self { assignment, indptr, selected })
    }
}

/// Serial Boltzmann assignment over all clusters.
///
/// Sequential by design: the occupancy penalty feeds back across clusters.
/// The random processing order removes ordering bias; the caller seeds and
/// records the RNG.
pub fn boltzmann_assign(
    candidates: &[Option<ClusterCandidates>],
    clusters: &ClustersFile,
    n_struct: usize,
    radius_kt: f64,
    rng: &mut StdRng,
) -> SpriteAssignment {
    let n_clusters = candidates.len();
    let ave_n = n_clusters as f64 / n_struct as f64;
    let std_n = ave_n.sqrt().max(f64::EPSILON);

    let mut occupancy = vec![0u32; n_struct];
    let mut assignment = vec![-1i64; n_clusters];
    let mut selected: Vec<Vec<i64>> = (0..n_clusters)
        .map(|c| vec![-1i64; clusters.cluster(c).len()])
        .collect();

    let mut order: Vec<usize> = (0..n_clusters).collect();
    order.shuffle(rng);

    for &ci in &order {
        let Some(cand) = &candidates[ci] else { continue };
        if cand.rg2.is_empty() {
            continue;
        }
        let rg: Vec<f64> = cand.rg2.iter().map(|&v| v.sqrt()).collect();
        let mut cumulative = Vec::with_capacity(rg.len());
        let mut acc = 0.0;
        let e0 = rg[0] / radius_kt
            + (occupancy[cand.structs[0]] as f64 - ave_n).max(0.0) / std_n;
        for (k, &g) in rg.iter().enumerate() {
            let e = (g - rg[0]) / radius_kt
                + (occupancy[cand.structs[k]] as f64 - ave_n).max(0.0) / std_n;
            acc += (-(e - e0)).exp();
            cumulative.push(acc);
        }
        let z = *cumulative.last().unwrap();
        let u = rng.gen::<f64>() * z;
        let pos = cumulative.partition_point(|&p| p < u).min(rg.len() - 1);
        let si = cand.structs[pos];
        occupancy[si] += 1;
        assignment[ci] = si as i64;
        selected[ci] = cand.picks[pos].iter().map(|&b| b as i64).collect();
    }

    SpriteAssignment {
        assignment,
        indptr: clusters.indptr.clone(),
        selected: selected.concat(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chromoplex_common::{Bead, Genome, GenomeIndex};
    use chromoplex_store::Layout;
    use ndarray::Array3;
    use rand::SeedableRng;

    /// Two diploid loci on one chromosome; coordinates from the given
    /// per-structure bead table.
    fn population(dir: &Path, crd: Array3<f64>) -> PopulationFile {
        let beads = vec![
            Bead { id: 0, chrom: 0, start: 0, end: 100, copy: 0, radius: 10.0 },
            Bead { id: 1, chrom: 0, start: 100, end: 200, copy: 0, radius: 10.0 },
            Bead { id: 2, chrom: 0, start: 0, end: 100, copy: 1, radius: 10.0 },
            Bead { id: 3, chrom: 0, start: 100, end: 200, copy: 1, radius: 10.0 },
        ];
        let index = GenomeIndex::new(&beads).unwrap();
        let nstruct = crd.shape()[1];
        let path = dir.join("sprite.cps");
        let mut pop = PopulationFile::create(
            &path,
            &index,
            &Genome::default(),
            &[10.0; 4],
            nstruct,
            "{}",
            Layout::BeadMajor,
        )
        .unwrap();
        pop.set_coordinates(&crd).unwrap();
        pop
    }

    #[test]
    fn per_structure_minimum_combination_is_found() {
        let dir = tempfile::tempdir().unwrap();
        // bead layout: locus0 copies = beads 0, 2; locus1 copies = beads 1, 3
        // structure 0: best picks are bead 2 (0.5,0,0) and bead 1 (0,-0.5,0)
        // structure 1: best picks are bead 0 (0.1,0,0) and bead 3 (-0.1,0,0)
        let mut crd = Array3::zeros((4, 2, 3));
        // structure 0
        crd[[0, 0, 0]] = 1.0;
        crd[[2, 0, 0]] = 0.5;
        crd[[1, 0, 1]] = -0.5;
        crd[[3, 0, 1]] = 0.5;
        // structure 1
        crd[[0, 1, 0]] = 0.1;
        crd[[2, 1, 0]] = 1.0;
        crd[[1, 1, 0]] = -1.0;
        crd[[3, 1, 0]] = -0.1;
        let mut pop = population(dir.path(), crd);

        let cand = cluster_candidates(&mut pop, &[0, 1], 50, 6).unwrap().unwrap();
        // keep_best covers both structures, sorted by rg2 ascending
        assert_eq!(cand.structs, vec![1, 0]);
        assert!((cand.rg2[0] - 0.01).abs() < 1e-9);
        assert!((cand.rg2[1] - 0.125).abs() < 1e-9);
        assert_eq!(cand.picks[0], vec![0, 3]);
        assert_eq!(cand.picks[1], vec![2, 1]);
    }

    #[test]
    fn giant_cluster_is_marked_inactive() {
        let dir = tempfile::tempdir().unwrap();
        // 10 haploid chromosomes, one locus each
        let beads: Vec<Bead> = (0..10)
            .map(|i| Bead {
                id: i,
                chrom: i as u32,
                start: 0,
                end: 100,
                copy: 0,
                radius: 10.0,
            })
            .collect();
        let index = GenomeIndex::new(&beads).unwrap();
        let path = dir.path().join("giant.cps");
        let mut pop = PopulationFile::create(
            &path,
            &index,
            &Genome::default(),
            &[10.0; 10],
            1,
            "{}",
            Layout::BeadMajor,
        )
        .unwrap();

        let cluster: Vec<usize> = (0..10).collect();
        let cand = cluster_candidates(&mut pop, &cluster, 50, 6).unwrap();
        assert!(cand.is_none());

        // and the reduce emits -1 placeholders for it
        let clusters = ClustersFile::from_clusters(&[cluster]);
        let mut rng = StdRng::seed_from_u64(11);
        let out = boltzmann_assign(&[None], &clusters, 1, 100.0, &mut rng);
        assert_eq!(out.assignment, vec![-1]);
        assert!(out.selected_beads(0).iter().all(|&b| b == -1));
    }

    #[test]
    fn boltzmann_assignment_updates_occupancy_and_picks() {
        let clusters = ClustersFile::from_clusters(&[vec![0, 1], vec![0, 1]]);
        let cand = ClusterCandidates {
            rg2: vec![1.0, 4.0],
            structs: vec![2, 0],
            picks: vec![vec![0, 1], vec![2, 3]],
        };
        let mut rng = StdRng::seed_from_u64(7);
        let out = boltzmann_assign(
            &[Some(cand.clone()), Some(cand)],
            &clusters,
            3,
            100.0,
            &mut rng,
        );
        for c in 0..2 {
            let s = out.assignment[c];
            assert!(s == 2 || s == 0);
            let beads = out.selected_beads(c);
            if s == 2 {
                assert_eq!(beads, &[0, 1]);
            } else {
                assert_eq!(beads, &[2, 3]);
            }
        }
    }

    #[test]
    fn clusters_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.cpxd");
        let cf = ClustersFile::from_clusters(&[vec![1, 2, 3], vec![], vec![7]]);
        cf.write(&path).unwrap();
        let cf2 = ClustersFile::read(&path).unwrap();
        assert_eq!(cf2.n_clusters(), 3);
        assert_eq!(cf2.cluster(0), &[1, 2, 3]);
        assert_eq!(cf2.cluster(1), &[] as &[usize]);
        assert_eq!(cf2.cluster(2), &[7]);
    }
}
