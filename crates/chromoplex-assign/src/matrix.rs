//! Sparse symmetric contact-probability matrix over haploid loci.
//!
//! Stored as upper-triangle COO triplets in the dataset container. This is
//! the Hi-C input produced by preprocessing; the assignment engine only
//! iterates candidate entries above the current sigma.

use std::path::Path;

use chromoplex_common::datafile::{DataFileReader, DataFileWriter};
use chromoplex_common::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct ContactMatrix {
    /// Number of haploid loci.
    pub n: usize,
    pub row: Vec<usize>,
    pub col: Vec<usize>,
    pub prob: Vec<f64>,
}

impl ContactMatrix {
    pub fn new(n: usize) -> Self {
        Self { n, ..Default::default() }
    }

    /// Insert a symmetric entry; stored once with row <= col.
    pub fn push(&mut self, i: usize, j: usize, p: f64) {
        let (i, j) = if i <= j { (i, j) } else { (j, i) };
        self.row.push(i);
        self.col.push(j);
        self.prob.push(p);
    }

    pub fn nnz(&self) -> usize {
        self.prob.len()
    }

    /// Iterate stored entries as (locus_i, locus_j, probability).
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.row
            .iter()
            .zip(self.col.iter())
            .zip(self.prob.iter())
            .map(|((&i, &j), &p)| (i, j, p))
    }

    /// Probability lookup; zero for absent entries.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        let (i, j) = if i <= j { (i, j) } else { (j, i) };
        self.iter()
            .find(|&(r, c, _)| r == i && c == j)
            .map(|(_, _, p)| p)
            .unwrap_or(0.0)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut w = DataFileWriter::new();
        w.put_i64("n", &[self.n as i64], &[1]);
        w.put_i64("row", &to_i64(&self.row), &[self.row.len() as u64]);
        w.put_i64("col", &to_i64(&self.col), &[self.col.len() as u64]);
        w.put_f64("prob", &self.prob, &[self.prob.len() as u64]);
        w.write_to(path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut r = DataFileReader::open(path)?;
        let n = r.read_i64("n")?[0] as usize;
        let row = from_i64(&r.read_i64("row")?)?;
        let col = from_i64(&r.read_i64("col")?)?;
        let prob = r.read_f64("prob")?;
        if row.len() != col.len() || row.len() != prob.len() {
            return Err(Error::DataFormat("contact matrix triplet lengths differ".into()));
        }
        for (&i, &j) in row.iter().zip(&col) {
            if i >= n || j >= n {
                return Err(Error::Assignment(format!(
                    "contact matrix entry ({}, {}) outside {} loci",
                    i, j, n
                )));
            }
        }
        Ok(Self { n, row, col, prob })
    }
}

pub(crate) fn to_i64(v: &[usize]) -> Vec<i64> {
    v.iter().map(|&x| x as i64).collect()
}

pub(crate) fn from_i64(v: &[i64]) -> Result<Vec<usize>> {
    v.iter()
        .map(|&x| {
            usize::try_from(x)
                .map_err(|_| Error::DataFormat(format!("negative index {} in data file", x)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_storage_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.cpxd");
        let mut m = ContactMatrix::new(4);
        m.push(2, 1, 0.8);
        m.push(0, 3, 0.4);
        m.write(&path).unwrap();

        let m2 = ContactMatrix::read(&path).unwrap();
        assert_eq!(m2.n, 4);
        assert_eq!(m2.get(1, 2), 0.8);
        assert_eq!(m2.get(2, 1), 0.8);
        assert_eq!(m2.get(0, 1), 0.0);
    }

    #[test]
    fn out_of_range_entries_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.cpxd");
        let mut m = ContactMatrix::new(2);
        m.push(0, 5, 0.5);
        m.write(&path).unwrap();
        assert!(ContactMatrix::read(&path).is_err());
    }
}
