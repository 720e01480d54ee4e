//! Population file implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use tracing::info;

use chromoplex_common::{Error, Genome, GenomeIndex, Result};

const MAGIC: &[u8; 4] = b"CPXP";
const VERSION: u16 = 2;
const HEADER_LEN: u64 = 4096;

/// Target bytes-per-chunk used to derive the committed chunk shape,
/// `pack_beads = max(1, PACK_SIZE / (3 * n_struct))`.
pub const PACK_SIZE: f64 = 1e6;

/// Physical ordering of the coordinate block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    /// (bead, struct, 3): a bead slab across the population is contiguous.
    BeadMajor,
    /// (struct, bead, 3): a single structure is contiguous.
    StructMajor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PopulationMeta {
    radii: Vec<f64>,
    index: GenomeIndex,
    genome: Genome,
    summary: String,
    config_data: String,
}

/// Random-access handle over a population file.
pub struct PopulationFile {
    file: File,
    path: PathBuf,
    writable: bool,
    layout: Layout,
    nbead: usize,
    nstruct: usize,
    chunk_beads: usize,
    violation: f64,
    meta_offset: u64,
    meta: PopulationMeta,
}

impl PopulationFile {
    /// Create a new population file with zeroed coordinates.
    pub fn create(
        path: &Path,
        index: &GenomeIndex,
        genome: &Genome,
        radii: &[f64],
        nstruct: usize,
        config_data: &str,
        layout: Layout,
    ) -> Result<Self> {
        index.validate(radii)?;
        let nbead = index.len();
        let meta = PopulationMeta {
            radii: radii.to_vec(),
            index: index.clone(),
            genome: genome.clone(),
            summary: String::new(),
            config_data: config_data.to_string(),
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let coord_len = (nbead * nstruct * 3 * 8) as u64;
        let meta_offset = HEADER_LEN + coord_len;

        {
            let mut w = BufWriter::new(&file);
            w.seek(SeekFrom::Start(HEADER_LEN))?;
            let zeros = vec![0u8; 1 << 16];
            let mut remaining = coord_len as usize;
            while remaining > 0 {
                let n = remaining.min(zeros.len());
                w.write_all(&zeros[..n])?;
                remaining -= n;
            }
            w.flush()?;
        }

        let mut pf = Self {
            file,
            path: path.to_path_buf(),
            writable: true,
            layout,
            nbead,
            nstruct,
            chunk_beads: pack_beads(nstruct, nbead),
            violation: 0.0,
            meta_offset,
            meta,
        };
        pf.write_meta()?;
        pf.write_header()?;
        Ok(pf)
    }

    pub fn open(path: &Path) -> Result<Self> {
        Self::open_impl(path, false)
    }

    pub fn open_rw(path: &Path) -> Result<Self> {
        Self::open_impl(path, true)
    }

    fn open_impl(path: &Path, writable: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| Error::DataFormat(format!("cannot open {}: {}", path.display(), e)))?;

        let mut header = [0u8; 80];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            return Err(Error::DataFormat(format!(
                "{} is not a population file",
                path.display()
            )));
        }
        let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
        if version != VERSION {
            return Err(Error::DataFormat(format!("unsupported population version {}", version)));
        }
        let layout = match header[6] {
            0 => Layout::BeadMajor,
            1 => Layout::StructMajor,
            x => return Err(Error::DataFormat(format!("unknown layout tag {}", x))),
        };
        let nbead = u64::from_le_bytes(header[8..16].try_into().unwrap()) as usize;
        let nstruct = u64::from_le_bytes(header[16..24].try_into().unwrap()) as usize;
        let chunk_beads = u64::from_le_bytes(header[24..32].try_into().unwrap()) as usize;
        let violation = f64::from_le_bytes(header[32..40].try_into().unwrap());
        let meta_offset = u64::from_le_bytes(header[40..48].try_into().unwrap());
        let checksum: [u8; 32] = header[48..80].try_into().unwrap();

        file.seek(SeekFrom::Start(meta_offset))?;
        let mut meta_buf = Vec::new();
        file.read_to_end(&mut meta_buf)?;
        if blake3::hash(&meta_buf).as_bytes() != &checksum {
            return Err(Error::DataFormat(format!(
                "{}: metadata checksum mismatch",
                path.display()
            )));
        }
        let meta: PopulationMeta = bincode::deserialize(&meta_buf)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            writable,
            layout,
            nbead,
            nstruct,
            chunk_beads,
            violation,
            meta_offset,
            meta,
        })
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; 80];
        header[0..4].copy_from_slice(MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_le_bytes());
        header[6] = match self.layout {
            Layout::BeadMajor => 0,
            Layout::StructMajor => 1,
        };
        header[8..16].copy_from_slice(&(self.nbead as u64).to_le_bytes());
        header[16..24].copy_from_slice(&(self.nstruct as u64).to_le_bytes());
        header[24..32].copy_from_slice(&(self.chunk_beads as u64).to_le_bytes());
        header[32..40].copy_from_slice(&self.violation.to_le_bytes());
        header[40..48].copy_from_slice(&self.meta_offset.to_le_bytes());

        let meta_buf = bincode::serialize(&self.meta)?;
        header[48..80].copy_from_slice(blake3::hash(&meta_buf).as_bytes());

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    fn write_meta(&mut self) -> Result<()> {
        let meta_buf = bincode::serialize(&self.meta)?;
        self.file.set_len(self.meta_offset)?;
        self.file.seek(SeekFrom::Start(self.meta_offset))?;
        self.file.write_all(&meta_buf)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn nbead(&self) -> usize {
        self.nbead
    }

    pub fn nstruct(&self) -> usize {
        self.nstruct
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn chunk_beads(&self) -> usize {
        self.chunk_beads
    }

    pub fn radii(&self) -> &[f64] {
        &self.meta.radii
    }

    pub fn index(&self) -> &GenomeIndex {
        &self.meta.index
    }

    pub fn genome(&self) -> &Genome {
        &self.meta.genome
    }

    pub fn violation(&self) -> f64 {
        self.violation
    }

    pub fn summary(&self) -> &str {
        &self.meta.summary
    }

    pub fn config_data(&self) -> &str {
        &self.meta.config_data
    }

    pub fn set_violation(&mut self, v: f64) -> Result<()> {
        self.check_writable()?;
        self.violation = v;
        self.write_header()
    }

    pub fn set_summary(&mut self, summary: &str) -> Result<()> {
        self.check_writable()?;
        self.meta.summary = summary.to_string();
        self.write_meta()?;
        self.write_header()
    }

    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} opened read-only", self.path.display()),
            )));
        }
        Ok(())
    }

    fn elem_offset(&self, bead: usize, strct: usize) -> u64 {
        let idx = match self.layout {
            Layout::BeadMajor => bead * self.nstruct + strct,
            Layout::StructMajor => strct * self.nbead + bead,
        };
        HEADER_LEN + (idx * 24) as u64
    }

    fn read_triples(&mut self, offset: u64, count: usize) -> Result<Vec<f64>> {
        let mut buf = vec![0u8; count * 24];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf.chunks_exact(8).map(|c| f64::from_le_bytes(c.try_into().unwrap())).collect())
    }

    fn write_triples(&mut self, offset: u64, values: &[f64]) -> Result<()> {
        let mut buf = Vec::with_capacity(values.len() * 8);
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    /// Coordinates of one bead across all structures, shape (n_struct, 3).
    pub fn get_bead_crd(&mut self, bead: usize) -> Result<Array2<f64>> {
        self.check_bead(bead)?;
        let data = match self.layout {
            Layout::BeadMajor => self.read_triples(self.elem_offset(bead, 0), self.nstruct)?,
            Layout::StructMajor => {
                let mut data = Vec::with_capacity(self.nstruct * 3);
                for s in 0..self.nstruct {
                    data.extend(self.read_triples(self.elem_offset(bead, s), 1)?);
                }
                data
            }
        };
        Array2::from_shape_vec((self.nstruct, 3), data)
            .map_err(|e| Error::DataFormat(e.to_string()))
    }

    /// Coordinates of one structure across all beads, shape (n_bead, 3).
    pub fn get_struct_crd(&mut self, strct: usize) -> Result<Array2<f64>> {
        self.check_struct(strct)?;
        let data = match self.layout {
            Layout::StructMajor => self.read_triples(self.elem_offset(0, strct), self.nbead)?,
            Layout::BeadMajor => {
                let mut data = Vec::with_capacity(self.nbead * 3);
                for b in 0..self.nbead {
                    data.extend(self.read_triples(self.elem_offset(b, strct), 1)?);
                }
                data
            }
        };
        Array2::from_shape_vec((self.nbead, 3), data).map_err(|e| Error::DataFormat(e.to_string()))
    }

    /// Overwrite the coordinate slice of a single structure.
    pub fn set_struct_crd(&mut self, strct: usize, crd: &Array2<f64>) -> Result<()> {
        self.check_writable()?;
        self.check_struct(strct)?;
        if crd.shape() != [self.nbead, 3] {
            return Err(Error::DataFormat(format!(
                "structure slice must have shape ({}, 3)",
                self.nbead
            )));
        }
        let flat: Vec<f64> = crd.iter().copied().collect();
        match self.layout {
            Layout::StructMajor => self.write_triples(self.elem_offset(0, strct), &flat)?,
            Layout::BeadMajor => {
                for b in 0..self.nbead {
                    self.write_triples(self.elem_offset(b, strct), &flat[b * 3..b * 3 + 3])?;
                }
            }
        }
        Ok(())
    }

    /// Full coordinate tensor in logical (bead, struct, 3) order.
    pub fn coordinates(&mut self) -> Result<Array3<f64>> {
        let total = self.nbead * self.nstruct;
        let data = self.read_triples(HEADER_LEN, total)?;
        let arr = match self.layout {
            Layout::BeadMajor => {
                Array3::from_shape_vec((self.nbead, self.nstruct, 3), data)
                    .map_err(|e| Error::DataFormat(e.to_string()))?
            }
            Layout::StructMajor => {
                let arr = Array3::from_shape_vec((self.nstruct, self.nbead, 3), data)
                    .map_err(|e| Error::DataFormat(e.to_string()))?;
                arr.permuted_axes([1, 0, 2]).to_owned()
            }
        };
        Ok(arr)
    }

    /// Overwrite the whole coordinate tensor.
    pub fn set_coordinates(&mut self, crd: &Array3<f64>) -> Result<()> {
        self.check_writable()?;
        if crd.shape() != [self.nbead, self.nstruct, 3] {
            return Err(Error::DataFormat(format!(
                "coordinate tensor must have shape ({}, {}, 3)",
                self.nbead, self.nstruct
            )));
        }
        let flat: Vec<f64> = match self.layout {
            Layout::BeadMajor => crd.iter().copied().collect(),
            Layout::StructMajor => crd.view().permuted_axes([1, 0, 2]).iter().copied().collect(),
        };
        self.write_triples(HEADER_LEN, &flat)
    }

    /// Rewrite into the committed bead-major layout at `dest`, preserving
    /// metadata and violation score. Chunked streaming keeps memory bounded
    /// by `chunk_beads * n_struct`.
    pub fn repack(&mut self, dest: &Path) -> Result<PopulationFile> {
        let chunk = pack_beads(self.nstruct, self.nbead);
        info!(chunk_beads = chunk, "repacking population into bead-major chunks");

        let mut out = PopulationFile::create(
            dest,
            &self.meta.index.clone(),
            &self.meta.genome.clone(),
            &self.meta.radii.clone(),
            self.nstruct,
            &self.meta.config_data.clone(),
            Layout::BeadMajor,
        )?;
        out.meta.summary = self.meta.summary.clone();
        out.write_meta()?;
        out.violation = self.violation;
        out.chunk_beads = chunk;
        out.write_header()?;

        let mut b0 = 0usize;
        while b0 < self.nbead {
            let nb = chunk.min(self.nbead - b0);
            // gather (nb, nstruct, 3) in bead-major order
            let mut block = vec![0f64; nb * self.nstruct * 3];
            match self.layout {
                Layout::BeadMajor => {
                    let data = self.read_triples(self.elem_offset(b0, 0), nb * self.nstruct)?;
                    block.copy_from_slice(&data);
                }
                Layout::StructMajor => {
                    for s in 0..self.nstruct {
                        let row = self.read_triples(self.elem_offset(b0, s), nb)?;
                        for b in 0..nb {
                            let dst = (b * self.nstruct + s) * 3;
                            block[dst..dst + 3].copy_from_slice(&row[b * 3..b * 3 + 3]);
                        }
                    }
                }
            }
            out.write_triples(out.elem_offset(b0, 0), &block)?;
            b0 += nb;
        }
        out.file.sync_all()?;
        Ok(out)
    }

    /// Flush file buffers to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn check_bead(&self, bead: usize) -> Result<()> {
        if bead >= self.nbead {
            return Err(Error::DataFormat(format!(
                "bead {} out of range ({} beads)",
                bead, self.nbead
            )));
        }
        Ok(())
    }

    fn check_struct(&self, strct: usize) -> Result<()> {
        if strct >= self.nstruct {
            return Err(Error::DataFormat(format!(
                "structure {} out of range ({} structures)",
                strct, self.nstruct
            )));
        }
        Ok(())
    }
}

/// Beads per committed chunk, sized so one chunk is about [`PACK_SIZE`] floats.
pub fn pack_beads(nstruct: usize, nbead: usize) -> usize {
    let p = (PACK_SIZE / (nstruct as f64 * 3.0)).floor() as usize;
    p.clamp(1, nbead.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chromoplex_common::Bead;
    use ndarray::Array;

    fn small_index(nbead: usize) -> (GenomeIndex, Vec<f64>) {
        let beads: Vec<Bead> = (0..nbead)
            .map(|i| Bead {
                id: i,
                chrom: 0,
                start: (i as u64) * 100,
                end: (i as u64 + 1) * 100,
                copy: 0,
                radius: 50.0,
            })
            .collect();
        (GenomeIndex::new(&beads).unwrap(), vec![50.0; nbead])
    }

    fn filled(nbead: usize, nstruct: usize) -> Array3<f64> {
        Array::from_shape_fn((nbead, nstruct, 3), |(b, s, k)| {
            (b * 1000 + s * 10 + k) as f64 + 0.5
        })
    }

    #[test]
    fn roundtrip_is_bitwise_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pop.cps");
        let (index, radii) = small_index(5);

        let crd = filled(5, 3);
        {
            let mut pf = PopulationFile::create(
                &path,
                &index,
                &Genome::default(),
                &radii,
                3,
                "{}",
                Layout::BeadMajor,
            )
            .unwrap();
            pf.set_coordinates(&crd).unwrap();
            pf.set_violation(0.25).unwrap();
            pf.set_summary("{\"n\":1}").unwrap();
        }

        let mut pf = PopulationFile::open(&path).unwrap();
        assert_eq!(pf.coordinates().unwrap(), crd);
        assert_eq!(pf.violation(), 0.25);
        assert_eq!(pf.summary(), "{\"n\":1}");
        assert_eq!(pf.radii(), &radii[..]);
    }

    #[test]
    fn bead_and_struct_slices_agree_across_layouts() {
        let dir = tempfile::tempdir().unwrap();
        let (index, radii) = small_index(4);
        let crd = filled(4, 2);

        for layout in [Layout::BeadMajor, Layout::StructMajor] {
            let path = dir.path().join(format!("p{:?}.cps", layout));
            let mut pf = PopulationFile::create(
                &path,
                &index,
                &Genome::default(),
                &radii,
                2,
                "{}",
                layout,
            )
            .unwrap();
            pf.set_coordinates(&crd).unwrap();

            let b2 = pf.get_bead_crd(2).unwrap();
            assert_eq!(b2, crd.index_axis(ndarray::Axis(0), 2).to_owned());
            let s1 = pf.get_struct_crd(1).unwrap();
            assert_eq!(s1, crd.index_axis(ndarray::Axis(1), 1).to_owned());
        }
    }

    #[test]
    fn repack_transposes_struct_major_assembly() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("pop.cps.tmp");
        let packed = dir.path().join("pop.cps");
        let (index, radii) = small_index(6);
        let crd = filled(6, 2);

        let mut pf = PopulationFile::create(
            &tmp,
            &index,
            &Genome::default(),
            &radii,
            2,
            "{}",
            Layout::StructMajor,
        )
        .unwrap();
        for s in 0..2 {
            pf.set_struct_crd(s, &crd.index_axis(ndarray::Axis(1), s).to_owned()).unwrap();
        }
        pf.set_violation(0.1).unwrap();
        pf.repack(&packed).unwrap();

        let mut out = PopulationFile::open(&packed).unwrap();
        assert_eq!(out.layout(), Layout::BeadMajor);
        assert_eq!(out.coordinates().unwrap(), crd);
        assert_eq!(out.violation(), 0.1);
    }

    #[test]
    fn read_only_handle_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pop.cps");
        let (index, radii) = small_index(2);
        PopulationFile::create(&path, &index, &Genome::default(), &radii, 1, "{}", Layout::BeadMajor)
            .unwrap();

        let mut pf = PopulationFile::open(&path).unwrap();
        assert!(pf.set_violation(1.0).is_err());
    }

    #[test]
    fn pack_beads_matches_recipe() {
        assert_eq!(pack_beads(1000, 100_000), 333);
        assert_eq!(pack_beads(1_000_000, 10), 1);
        assert_eq!(pack_beads(2, 5), 5); // capped at nbead
    }
}
