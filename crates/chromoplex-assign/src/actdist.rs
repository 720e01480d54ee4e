//! Hi-C activation distances.
//!
//! For every candidate locus pair above the sigma cutoff, the engine looks
//! at the achieved contact probability in the current population, applies
//! the two-step iterative correction against the previous iteration's
//! corrected probability, and picks the order statistic of the distance
//! slab that will realize the remaining probability in the next modeling
//! step.

use std::path::Path;

use chromoplex_common::datafile::{DataFileReader, DataFileWriter};
use chromoplex_common::{Error, Result};
use chromoplex_store::PopulationFile;

use crate::clean_probability;
use crate::matrix::{from_i64, to_i64};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActdistRow {
    /// First bead id of the activated pair.
    pub row: usize,
    /// Second bead id.
    pub col: usize,
    /// Activation distance: impose the bond when the pair is at most this
    /// far apart.
    pub dist: f64,
    /// Corrected probability that produced this activation.
    pub prob: f64,
}

/// Compute activation rows for one haploid locus pair.
///
/// Intra-chromosomal pairs pair corresponding copies; inter-chromosomal
/// pairs enumerate all copy combinations. Ties at the order statistic all
/// receive the same activation distance, so downstream behavior does not
/// depend on sort stability.
pub fn compute_pair_actdist(
    pop: &mut PopulationFile,
    locus_i: usize,
    locus_j: usize,
    pwish: f64,
    plast: f64,
    contact_range: f64,
) -> Result<Vec<ActdistRow>> {
    if locus_i == locus_j {
        return Ok(Vec::new());
    }
    let index = pop.index().clone();
    let nstruct = pop.nstruct();
    let ii = index.copies(locus_i).to_vec();
    let jj = index.copies(locus_j).to_vec();
    let intra = index.locus_chrom(locus_i) == index.locus_chrom(locus_j);

    let radii = pop.radii();
    let ri = radii[ii[0]];
    let rj = radii[jj[0]];
    let cutoff_sq = (contact_range * (ri + rj)).powi(2);

    // bead pairings per combination
    let pairings: Vec<(usize, usize)> = if intra {
        ii.iter().copied().zip(jj.iter().copied()).collect()
    } else {
        ii.iter().flat_map(|&a| jj.iter().map(move |&b| (a, b))).collect()
    };
    let n_combinations = pairings.len();
    let n_possible = if intra { ii.len().min(jj.len()) } else { n_combinations };

    // squared distances, (combination, structure)
    let mut d_sq = vec![vec![0.0f64; nstruct]; n_combinations];
    for (c, &(a, b)) in pairings.iter().enumerate() {
        let xa = pop.get_bead_crd(a)?;
        let xb = pop.get_bead_crd(b)?;
        for s in 0..nstruct {
            let dx = xa[[s, 0]] - xb[[s, 0]];
            let dy = xa[[s, 1]] - xb[[s, 1]];
            let dz = xa[[s, 2]] - xb[[s, 2]];
            d_sq[c][s] = dx * dx + dy * dy + dz * dz;
        }
    }

    // per structure, keep the n_possible closest combinations
    let mut slab = Vec::with_capacity(n_possible * nstruct);
    let mut contact_count = 0usize;
    let mut column = vec![0.0f64; n_combinations];
    for s in 0..nstruct {
        for c in 0..n_combinations {
            column[c] = d_sq[c][s];
        }
        column.sort_by(|a, b| a.partial_cmp(b).expect("finite distances"));
        for &v in column.iter().take(n_possible) {
            if v <= cutoff_sq {
                contact_count += 1;
            }
            slab.push(v);
        }
    }
    let p_now = contact_count as f64 / (n_possible * nstruct) as f64;

    let t = clean_probability(p_now, plast);
    let p_new = clean_probability(pwish, t);

    let mut rows = Vec::new();
    if p_new > 0.0 {
        slab.sort_by(|a, b| a.partial_cmp(b).expect("finite distances"));
        let o = ((n_possible as f64 * p_new * nstruct as f64).round() as usize)
            .min(n_possible * nstruct - 1);
        let d_act = slab[o].sqrt();
        for &(a, b) in &pairings {
            rows.push(ActdistRow { row: a, col: b, dist: d_act, prob: p_new });
        }
    }
    Ok(rows)
}

pub fn write_actdist(path: &Path, rows: &[ActdistRow]) -> Result<()> {
    let mut w = DataFileWriter::new();
    let row: Vec<usize> = rows.iter().map(|r| r.row).collect();
    let col: Vec<usize> = rows.iter().map(|r| r.col).collect();
    let dist: Vec<f64> = rows.iter().map(|r| r.dist).collect();
    let prob: Vec<f64> = rows.iter().map(|r| r.prob).collect();
    w.put_i64("row", &to_i64(&row), &[row.len() as u64]);
    w.put_i64("col", &to_i64(&col), &[col.len() as u64]);
    w.put_f64("dist", &dist, &[dist.len() as u64]);
    w.put_f64("prob", &prob, &[prob.len() as u64]);
    w.write_to(path)
}

pub fn read_actdist(path: &Path) -> Result<Vec<ActdistRow>> {
    let mut stream = ActdistStream::open(path, 10_000)?;
    let mut rows = Vec::with_capacity(stream.len());
    while let Some(chunk) = stream.next_chunk()? {
        rows.extend_from_slice(&chunk);
    }
    Ok(rows)
}

/// Chunked reader over an activation-distance table; keeps memory bounded
/// by the chunk size instead of the table size.
pub struct ActdistStream {
    reader: DataFileReader,
    len: usize,
    cursor: usize,
    chunk_size: usize,
}

impl ActdistStream {
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self> {
        let reader = DataFileReader::open(path)?;
        let mut stream = Self { reader, len: 0, cursor: 0, chunk_size: chunk_size.max(1) };
        stream.len = stream.reader.len("row")?;
        let cols = stream.reader.len("col")?;
        if cols != stream.len {
            return Err(Error::Assignment("activation table has ragged columns".into()));
        }
        Ok(stream)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn next_chunk(&mut self) -> Result<Option<Vec<ActdistRow>>> {
        if self.cursor >= self.len {
            return Ok(None);
        }
        let count = self.chunk_size.min(self.len - self.cursor);
        let row = from_i64(&self.reader.read_i64_range("row", self.cursor, count)?)?;
        let col = from_i64(&self.reader.read_i64_range("col", self.cursor, count)?)?;
        let dist = self.reader.read_f64_range("dist", self.cursor, count)?;
        let prob = self.reader.read_f64_range("prob", self.cursor, count)?;
        self.cursor += count;
        Ok(Some(
            (0..count)
                .map(|k| ActdistRow { row: row[k], col: col[k], dist: dist[k], prob: prob[k] })
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chromoplex_common::{Bead, Genome, GenomeIndex};
    use chromoplex_store::Layout;
    use ndarray::Array3;

    /// One diploid chromosome with 2 loci: beads 0,1 copy 0 and 2,3 copy 1.
    fn twin_population(dir: &Path) -> PopulationFile {
        let beads = vec![
            Bead { id: 0, chrom: 0, start: 0, end: 100, copy: 0, radius: 100.0 },
            Bead { id: 1, chrom: 0, start: 100, end: 200, copy: 0, radius: 100.0 },
            Bead { id: 2, chrom: 0, start: 0, end: 100, copy: 1, radius: 100.0 },
            Bead { id: 3, chrom: 0, start: 100, end: 200, copy: 1, radius: 100.0 },
        ];
        let index = GenomeIndex::new(&beads).unwrap();
        let path = dir.join("twin.cps");
        let mut pop = PopulationFile::create(
            &path,
            &index,
            &Genome::default(),
            &[100.0; 4],
            2,
            "{}",
            Layout::BeadMajor,
        )
        .unwrap();

        // both structures identical: copy-0 loci 300 apart, copy-1 500 apart
        let mut crd = Array3::zeros((4, 2, 3));
        for s in 0..2 {
            crd[[1, s, 0]] = 300.0;
            crd[[2, s, 1]] = 5000.0;
            crd[[3, s, 1]] = 5000.0;
            crd[[3, s, 0]] = 500.0;
        }
        pop.set_coordinates(&crd).unwrap();
        pop
    }

    #[test]
    fn identical_twins_activation_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut pop = twin_population(dir.path());

        let rows = compute_pair_actdist(&mut pop, 0, 1, 1.0, 0.0, 2.0).unwrap();
        // intra pair with diagonal copy pairing: two rows
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].row, rows[0].col), (0, 1));
        assert_eq!((rows[1].row, rows[1].col), (2, 3));
        // slab {300, 300, 500, 500}: index round(2*1*2)=4 capped to 3
        assert!((rows[0].dist - 500.0).abs() < 1e-9);
        assert!((rows[0].prob - 1.0).abs() < 1e-12);
    }

    #[test]
    fn achieved_probability_suppresses_new_bonds() {
        let dir = tempfile::tempdir().unwrap();
        let mut pop = twin_population(dir.path());
        // wish 0.5 but both copy-0 pairs are already within the 400 cutoff:
        // p_now = 0.5 and clean(0.5, 0.5) = 0 -> no rows
        let rows = compute_pair_actdist(&mut pop, 0, 1, 0.5, 0.0, 2.0).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn prior_correction_suppresses_new_bonds() {
        let dir = tempfile::tempdir().unwrap();
        let mut pop = twin_population(dir.path());
        // p_last >= p_wish: nothing new to impose regardless of geometry
        let rows = compute_pair_actdist(&mut pop, 0, 1, 0.4, 0.6, 2.0).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn self_pair_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut pop = twin_population(dir.path());
        assert!(compute_pair_actdist(&mut pop, 1, 1, 1.0, 0.0, 2.0).unwrap().is_empty());
    }

    #[test]
    fn table_roundtrip_and_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actdist.cpxd");
        let rows: Vec<ActdistRow> = (0..25)
            .map(|k| ActdistRow { row: k, col: k + 1, dist: k as f64 * 1.5, prob: 0.5 })
            .collect();
        write_actdist(&path, &rows).unwrap();

        let mut stream = ActdistStream::open(&path, 10).unwrap();
        assert_eq!(stream.len(), 25);
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next_chunk().unwrap() {
            assert!(chunk.len() <= 10);
            collected.extend(chunk);
        }
        assert_eq!(collected, rows);
    }
}
