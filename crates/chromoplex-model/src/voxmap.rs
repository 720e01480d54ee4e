//! Voxel occupancy map for non-ideal nuclear envelopes.
//!
//! The map file stores a binary occupancy grid (1 = allowed region). At load
//! time a chamfer distance transform turns it into a signed distance field:
//! negative inside the allowed region, positive outside, in length units.

use std::path::Path;

use chromoplex_common::datafile::{DataFileReader, DataFileWriter};
use chromoplex_common::{Error, Result};

#[derive(Debug)]
pub struct VoxelMap {
    origin: [f64; 3],
    spacing: [f64; 3],
    dims: [usize; 3],
    /// Signed distance per voxel, voxel units scaled by mean spacing.
    sdf: Vec<f32>,
}

impl VoxelMap {
    /// Load an occupancy map file and precompute the distance field.
    pub fn load(path: &Path) -> Result<Self> {
        let mut r = DataFileReader::open(path)?;
        let origin_v = r.read_f64("origin")?;
        let spacing_v = r.read_f64("spacing")?;
        let dims_v = r.read_i64("dims")?;
        let occupancy = r.read_bytes("occupancy")?;
        if origin_v.len() != 3 || spacing_v.len() != 3 || dims_v.len() != 3 {
            return Err(Error::DataFormat("voxel map needs 3D origin/spacing/dims".into()));
        }
        let dims = [dims_v[0] as usize, dims_v[1] as usize, dims_v[2] as usize];
        let n = dims[0] * dims[1] * dims[2];
        if occupancy.len() != n {
            return Err(Error::DataFormat(format!(
                "voxel map occupancy has {} entries, dims imply {}",
                occupancy.len(),
                n
            )));
        }
        if occupancy.iter().all(|&v| v == 0) {
            return Err(Error::DataFormat("voxel map has no allowed region".into()));
        }
        let origin = [origin_v[0], origin_v[1], origin_v[2]];
        let spacing = [spacing_v[0], spacing_v[1], spacing_v[2]];
        let sdf = distance_transform(&occupancy, dims, spacing);
        Ok(Self { origin, spacing, dims, sdf })
    }

    /// Write an occupancy map file (used by preprocessing and tests).
    pub fn write_occupancy(
        path: &Path,
        origin: [f64; 3],
        spacing: [f64; 3],
        dims: [usize; 3],
        occupancy: &[u8],
    ) -> Result<()> {
        let mut w = DataFileWriter::new();
        w.put_f64("origin", &origin, &[3]);
        w.put_f64("spacing", &spacing, &[3]);
        w.put_i64("dims", &[dims[0] as i64, dims[1] as i64, dims[2] as i64], &[3]);
        w.put_bytes("occupancy", occupancy);
        w.write_to(path)?;
        Ok(())
    }

    /// Geometric mean of the bounding-box semiaxes; the effective radius
    /// used to scale violation ratios.
    pub fn effective_radius(&self) -> f64 {
        let sx = self.spacing[0] * self.dims[0] as f64 / 2.0;
        let sy = self.spacing[1] * self.dims[1] as f64 / 2.0;
        let sz = self.spacing[2] * self.dims[2] as f64 / 2.0;
        (sx * sy * sz).cbrt()
    }

    fn voxel_of(&self, pos: [f64; 3]) -> Option<[usize; 3]> {
        let mut v = [0usize; 3];
        for d in 0..3 {
            let x = (pos[d] - self.origin[d]) / self.spacing[d];
            if x < 0.0 || x >= self.dims[d] as f64 {
                return None;
            }
            v[d] = x as usize;
        }
        Some(v)
    }

    /// Signed distance of a point to the allowed region boundary; positive
    /// outside the allowed region. Points outside the grid are treated as
    /// deep outside.
    pub fn signed_distance(&self, pos: [f64; 3]) -> f64 {
        match self.voxel_of(pos) {
            Some([i, j, k]) => {
                let idx = (i * self.dims[1] + j) * self.dims[2] + k;
                self.sdf[idx] as f64
            }
            None => {
                // distance to the bounding box plus the largest inside value
                let mut d2 = 0.0;
                for dim in 0..3 {
                    let lo = self.origin[dim];
                    let hi = self.origin[dim] + self.spacing[dim] * self.dims[dim] as f64;
                    let x = pos[dim];
                    if x < lo {
                        d2 += (lo - x) * (lo - x);
                    } else if x > hi {
                        d2 += (x - hi) * (x - hi);
                    }
                }
                d2.sqrt() + self.mean_spacing()
            }
        }
    }

    /// Central-difference gradient of the distance field.
    pub fn gradient(&self, pos: [f64; 3]) -> [f64; 3] {
        let mut g = [0.0; 3];
        for d in 0..3 {
            let h = self.spacing[d];
            let mut lo = pos;
            let mut hi = pos;
            lo[d] -= h;
            hi[d] += h;
            g[d] = (self.signed_distance(hi) - self.signed_distance(lo)) / (2.0 * h);
        }
        g
    }

    fn mean_spacing(&self) -> f64 {
        (self.spacing[0] + self.spacing[1] + self.spacing[2]) / 3.0
    }
}

/// Two-pass chamfer distance transform over the occupancy grid.
fn distance_transform(occupancy: &[u8], dims: [usize; 3], spacing: [f64; 3]) -> Vec<f32> {
    let n = occupancy.len();
    let step = ((spacing[0] + spacing[1] + spacing[2]) / 3.0) as f32;
    let inf = f32::MAX / 4.0;

    // dist_out: distance to the nearest allowed voxel (0 inside allowed)
    // dist_in: distance to the nearest forbidden voxel (0 outside allowed)
    let mut dist_out: Vec<f32> = occupancy.iter().map(|&v| if v != 0 { 0.0 } else { inf }).collect();
    let mut dist_in: Vec<f32> = occupancy.iter().map(|&v| if v != 0 { inf } else { 0.0 }).collect();

    chamfer_sweep(&mut dist_out, dims, step);
    chamfer_sweep(&mut dist_in, dims, step);

    let mut sdf = vec![0f32; n];
    for i in 0..n {
        sdf[i] = if occupancy[i] != 0 { -dist_in[i] } else { dist_out[i] };
    }
    sdf
}

fn chamfer_sweep(dist: &mut [f32], dims: [usize; 3], step: f32) {
    let idx = |i: usize, j: usize, k: usize| (i * dims[1] + j) * dims[2] + k;
    // forward pass
    for i in 0..dims[0] {
        for j in 0..dims[1] {
            for k in 0..dims[2] {
                let mut d = dist[idx(i, j, k)];
                if i > 0 {
                    d = d.min(dist[idx(i - 1, j, k)] + step);
                }
                if j > 0 {
                    d = d.min(dist[idx(i, j - 1, k)] + step);
                }
                if k > 0 {
                    d = d.min(dist[idx(i, j, k - 1)] + step);
                }
                dist[idx(i, j, k)] = d;
            }
        }
    }
    // backward pass
    for i in (0..dims[0]).rev() {
        for j in (0..dims[1]).rev() {
            for k in (0..dims[2]).rev() {
                let mut d = dist[idx(i, j, k)];
                if i + 1 < dims[0] {
                    d = d.min(dist[idx(i + 1, j, k)] + step);
                }
                if j + 1 < dims[1] {
                    d = d.min(dist[idx(i, j + 1, k)] + step);
                }
                if k + 1 < dims[2] {
                    d = d.min(dist[idx(i, j, k + 1)] + step);
                }
                dist[idx(i, j, k)] = d;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ball_map(dir: &Path) -> std::path::PathBuf {
        // 11^3 grid of spacing 10 centered on the origin, allowed = ball r=30
        let dims = [11usize, 11, 11];
        let mut occ = vec![0u8; 11 * 11 * 11];
        for i in 0..11 {
            for j in 0..11 {
                for k in 0..11 {
                    let x = (i as f64 - 5.0) * 10.0;
                    let y = (j as f64 - 5.0) * 10.0;
                    let z = (k as f64 - 5.0) * 10.0;
                    if (x * x + y * y + z * z).sqrt() <= 30.0 {
                        occ[(i * 11 + j) * 11 + k] = 1;
                    }
                }
            }
        }
        let path = dir.join("map.cpxd");
        VoxelMap::write_occupancy(&path, [-55.0, -55.0, -55.0], [10.0, 10.0, 10.0], dims, &occ)
            .unwrap();
        path
    }

    #[test]
    fn signed_distance_changes_sign_at_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let map = VoxelMap::load(&ball_map(dir.path())).unwrap();
        assert!(map.signed_distance([0.0, 0.0, 0.0]) < 0.0);
        assert!(map.signed_distance([50.0, 0.0, 0.0]) > 0.0);
        assert!(map.signed_distance([500.0, 0.0, 0.0]) > 50.0);
    }

    #[test]
    fn empty_map_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.cpxd");
        VoxelMap::write_occupancy(&path, [0.0; 3], [1.0; 3], [2, 2, 2], &[0u8; 8]).unwrap();
        assert!(VoxelMap::load(&path).is_err());
    }
}
