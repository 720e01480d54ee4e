//! Genome index: ordered bead records and the derived copy index.
//!
//! Beads are genomic bins of a multiploid genome. Every haploid locus maps to
//! one bead per copy; the copy index groups those bead ids so that assignment
//! engines can enumerate homolog combinations.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Immutable identity of a single bead.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bead {
    pub id: usize,
    pub chrom: u32,
    pub start: u64,
    pub end: u64,
    pub copy: u32,
    pub radius: f64,
}

/// Genome metadata carried alongside the population.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Genome {
    pub assembly: String,
    pub chrom_names: Vec<String>,
    pub chrom_lengths: Vec<u64>,
}

/// Ordered bead index with the derived haploid-locus copy index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenomeIndex {
    chrom: Vec<u32>,
    start: Vec<u64>,
    end: Vec<u64>,
    copy: Vec<u32>,
    /// haploid locus id -> bead ids of its copies, ordered by copy number
    copy_index: Vec<Vec<usize>>,
    /// bead id -> haploid locus id
    locus_of: Vec<usize>,
    /// chain id per bead; a chain is a run of beads sharing (chrom, copy)
    chain: Vec<u32>,
}

impl GenomeIndex {
    /// Build the index from per-bead records, deriving the copy index.
    ///
    /// Beads must be ordered so that all copies of a locus carry identical
    /// (chrom, start, end); loci are numbered in order of first appearance.
    pub fn new(beads: &[Bead]) -> Result<Self> {
        let n = beads.len();
        let mut chrom = Vec::with_capacity(n);
        let mut start = Vec::with_capacity(n);
        let mut end = Vec::with_capacity(n);
        let mut copy = Vec::with_capacity(n);
        let mut chain = Vec::with_capacity(n);

        let mut copy_index: Vec<Vec<usize>> = Vec::new();
        let mut locus_of = vec![usize::MAX; n];
        let mut locus_lookup: std::collections::HashMap<(u32, u64, u64), usize> =
            std::collections::HashMap::new();

        let mut chain_id = 0u32;
        for (i, b) in beads.iter().enumerate() {
            if b.id != i {
                return Err(Error::DataFormat(format!(
                    "bead id {} at position {} is out of order",
                    b.id, i
                )));
            }
            if i > 0 {
                let p = &beads[i - 1];
                if p.chrom != b.chrom || p.copy != b.copy {
                    chain_id += 1;
                }
            }
            chrom.push(b.chrom);
            start.push(b.start);
            end.push(b.end);
            copy.push(b.copy);
            chain.push(chain_id);

            let key = (b.chrom, b.start, b.end);
            let locus = *locus_lookup.entry(key).or_insert_with(|| {
                copy_index.push(Vec::new());
                copy_index.len() - 1
            });
            if copy_index[locus].contains(&i) {
                return Err(Error::DataFormat(format!("duplicate bead {} for locus {}", i, locus)));
            }
            copy_index[locus].push(i);
            locus_of[i] = locus;
        }

        // copies of a locus must be ordered by copy number
        for (locus, ids) in copy_index.iter().enumerate() {
            for w in ids.windows(2) {
                if beads[w[0]].copy >= beads[w[1]].copy {
                    return Err(Error::DataFormat(format!(
                        "copies of locus {} are not ordered by copy number",
                        locus
                    )));
                }
            }
        }

        Ok(Self { chrom, start, end, copy, copy_index, locus_of, chain })
    }

    pub fn len(&self) -> usize {
        self.chrom.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chrom.is_empty()
    }

    pub fn n_loci(&self) -> usize {
        self.copy_index.len()
    }

    pub fn chrom(&self) -> &[u32] {
        &self.chrom
    }

    pub fn start(&self) -> &[u64] {
        &self.start
    }

    pub fn end(&self) -> &[u64] {
        &self.end
    }

    pub fn copy(&self) -> &[u32] {
        &self.copy
    }

    pub fn chain(&self) -> &[u32] {
        &self.chain
    }

    pub fn n_chains(&self) -> usize {
        self.chain.last().map(|&c| c as usize + 1).unwrap_or(0)
    }

    /// Bead ids of all copies of a haploid locus.
    pub fn copies(&self, locus: usize) -> &[usize] {
        &self.copy_index[locus]
    }

    /// Haploid locus id of a bead.
    pub fn locus_of(&self, bead: usize) -> usize {
        self.locus_of[bead]
    }

    /// Chromosome id of a haploid locus.
    pub fn locus_chrom(&self, locus: usize) -> u32 {
        self.chrom[self.copy_index[locus][0]]
    }

    pub fn bead(&self, i: usize, radius: f64) -> Bead {
        Bead {
            id: i,
            chrom: self.chrom[i],
            start: self.start[i],
            end: self.end[i],
            copy: self.copy[i],
            radius,
        }
    }

    /// Verify that the copy index partitions the bead set and that copies of
    /// a locus agree on radius.
    pub fn validate(&self, radii: &[f64]) -> Result<()> {
        if radii.len() != self.len() {
            return Err(Error::DataFormat(format!(
                "radii length {} does not match bead count {}",
                radii.len(),
                self.len()
            )));
        }
        let mut seen = vec![false; self.len()];
        for ids in &self.copy_index {
            let r0 = radii[ids[0]];
            for &i in ids {
                if seen[i] {
                    return Err(Error::DataFormat(format!("bead {} appears in two loci", i)));
                }
                seen[i] = true;
                if (radii[i] - r0).abs() > f64::EPSILON {
                    return Err(Error::DataFormat(format!(
                        "copies of a locus disagree on radius at bead {}",
                        i
                    )));
                }
            }
        }
        if let Some(missing) = seen.iter().position(|&s| !s) {
            return Err(Error::DataFormat(format!("bead {} belongs to no locus", missing)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diploid_two_loci() -> Vec<Bead> {
        // one chromosome, two loci, two copies each: beads 0,1 copy 0 and 2,3 copy 1
        vec![
            Bead { id: 0, chrom: 0, start: 0, end: 100, copy: 0, radius: 100.0 },
            Bead { id: 1, chrom: 0, start: 100, end: 200, copy: 0, radius: 100.0 },
            Bead { id: 2, chrom: 0, start: 0, end: 100, copy: 1, radius: 100.0 },
            Bead { id: 3, chrom: 0, start: 100, end: 200, copy: 1, radius: 100.0 },
        ]
    }

    #[test]
    fn copy_index_partitions_beads() {
        let index = GenomeIndex::new(&diploid_two_loci()).unwrap();
        assert_eq!(index.n_loci(), 2);
        assert_eq!(index.copies(0), &[0, 2]);
        assert_eq!(index.copies(1), &[1, 3]);
        assert_eq!(index.locus_of(3), 1);
        index.validate(&[100.0; 4]).unwrap();
    }

    #[test]
    fn chains_split_on_copy_change() {
        let index = GenomeIndex::new(&diploid_two_loci()).unwrap();
        assert_eq!(index.chain(), &[0, 0, 1, 1]);
        assert_eq!(index.n_chains(), 2);
    }

    #[test]
    fn mismatched_radii_rejected() {
        let index = GenomeIndex::new(&diploid_two_loci()).unwrap();
        assert!(index.validate(&[100.0, 100.0, 100.0, 50.0]).is_err());
    }
}
