//! Binary named-dataset container used for the population store and the
//! per-modality assignment artifacts.
//!
//! Layout: magic + version, a bincode header describing the datasets
//! (name, dtype, shape, offset), then the raw little-endian payloads.
//! Datasets can be read whole or as element ranges, so large tables are
//! streamed in chunks rather than loaded into memory.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"CPXD";
const VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    F64,
    F32,
    I64,
    I32,
    Bytes,
}

impl Dtype {
    fn elem_size(self) -> usize {
        match self {
            Dtype::F64 | Dtype::I64 => 8,
            Dtype::F32 | Dtype::I32 => 4,
            Dtype::Bytes => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatasetEntry {
    name: String,
    dtype: Dtype,
    shape: Vec<u64>,
    offset: u64,
    nbytes: u64,
}

/// In-memory builder that serializes all datasets in one pass.
#[derive(Default)]
pub struct DataFileWriter {
    datasets: Vec<(DatasetEntry, Vec<u8>)>,
}

impl DataFileWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: &str, dtype: Dtype, shape: Vec<u64>, payload: Vec<u8>) {
        let entry = DatasetEntry {
            name: name.to_string(),
            dtype,
            shape,
            offset: 0,
            nbytes: payload.len() as u64,
        };
        self.datasets.push((entry, payload));
    }

    pub fn put_f64(&mut self, name: &str, data: &[f64], shape: &[u64]) {
        let mut buf = Vec::with_capacity(data.len() * 8);
        for v in data {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        self.push(name, Dtype::F64, shape.to_vec(), buf);
    }

    pub fn put_f32(&mut self, name: &str, data: &[f32], shape: &[u64]) {
        let mut buf = Vec::with_capacity(data.len() * 4);
        for v in data {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        self.push(name, Dtype::F32, shape.to_vec(), buf);
    }

    pub fn put_i64(&mut self, name: &str, data: &[i64], shape: &[u64]) {
        let mut buf = Vec::with_capacity(data.len() * 8);
        for v in data {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        self.push(name, Dtype::I64, shape.to_vec(), buf);
    }

    pub fn put_i32(&mut self, name: &str, data: &[i32], shape: &[u64]) {
        let mut buf = Vec::with_capacity(data.len() * 4);
        for v in data {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        self.push(name, Dtype::I32, shape.to_vec(), buf);
    }

    pub fn put_bytes(&mut self, name: &str, data: &[u8]) {
        self.push(name, Dtype::Bytes, vec![data.len() as u64], data.to_vec());
    }

    pub fn put_json<T: Serialize>(&mut self, name: &str, value: &T) -> Result<()> {
        let buf = serde_json::to_vec(value)?;
        self.put_bytes(name, &buf);
        Ok(())
    }

    /// Write the container. The write goes to `path` directly; callers that
    /// need atomicity write to a temporary name and rename over.
    pub fn write_to(&mut self, path: &Path) -> Result<()> {
        let mut entries: Vec<DatasetEntry> =
            self.datasets.iter().map(|(e, _)| e.clone()).collect();

        // two-pass: serialize the header with dummy offsets to learn its
        // size, then fix the offsets and serialize again
        let header0 = bincode::serialize(&entries)?;
        let data_start = (MAGIC.len() + 2 + 8 + header0.len()) as u64;
        let mut offset = data_start;
        for e in entries.iter_mut() {
            e.offset = offset;
            offset += e.nbytes;
        }
        let header = bincode::serialize(&entries)?;
        debug_assert_eq!(header.len(), header0.len());

        let mut f = File::create(path)?;
        f.write_all(MAGIC)?;
        f.write_all(&VERSION.to_le_bytes())?;
        f.write_all(&(header.len() as u64).to_le_bytes())?;
        f.write_all(&header)?;
        for (_, payload) in &self.datasets {
            f.write_all(payload)?;
        }
        f.sync_all()?;
        Ok(())
    }
}

/// Random-access reader over a dataset container.
pub struct DataFileReader {
    file: File,
    entries: Vec<DatasetEntry>,
}

impl DataFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| Error::DataFormat(format!("cannot open {}: {}", path.display(), e)))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::DataFormat(format!("{} is not a dataset file", path.display())));
        }
        let mut vbuf = [0u8; 2];
        file.read_exact(&mut vbuf)?;
        let version = u16::from_le_bytes(vbuf);
        if version != VERSION {
            return Err(Error::DataFormat(format!("unsupported dataset version {}", version)));
        }
        let mut lbuf = [0u8; 8];
        file.read_exact(&mut lbuf)?;
        let header_len = u64::from_le_bytes(lbuf) as usize;
        let mut header = vec![0u8; header_len];
        file.read_exact(&mut header)?;
        let entries: Vec<DatasetEntry> = bincode::deserialize(&header)?;
        Ok(Self { file, entries })
    }

    fn entry(&self, name: &str) -> Result<&DatasetEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::DataFormat(format!("missing dataset '{}'", name)))
    }

    pub fn has_dataset(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn shape(&self, name: &str) -> Result<Vec<u64>> {
        Ok(self.entry(name)?.shape.clone())
    }

    /// Number of elements in a dataset.
    pub fn len(&self, name: &str) -> Result<usize> {
        let e = self.entry(name)?;
        Ok((e.nbytes as usize) / e.dtype.elem_size())
    }

    fn read_raw(&mut self, name: &str, dtype: Dtype, start: usize, count: usize) -> Result<Vec<u8>> {
        let e = self.entry(name)?;
        if e.dtype != dtype {
            return Err(Error::DataFormat(format!(
                "dataset '{}' has dtype {:?}, requested {:?}",
                name, e.dtype, dtype
            )));
        }
        let esz = dtype.elem_size();
        let total = (e.nbytes as usize) / esz;
        if start + count > total {
            return Err(Error::DataFormat(format!(
                "range {}..{} out of bounds for dataset '{}' of length {}",
                start,
                start + count,
                name,
                total
            )));
        }
        let offset = e.offset + (start * esz) as u64;
        let mut buf = vec![0u8; count * esz];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_f64(&mut self, name: &str) -> Result<Vec<f64>> {
        let n = self.len(name)?;
        self.read_f64_range(name, 0, n)
    }

    pub fn read_f64_range(&mut self, name: &str, start: usize, count: usize) -> Result<Vec<f64>> {
        let buf = self.read_raw(name, Dtype::F64, start, count)?;
        Ok(buf.chunks_exact(8).map(|c| f64::from_le_bytes(c.try_into().unwrap())).collect())
    }

    pub fn read_f32(&mut self, name: &str) -> Result<Vec<f32>> {
        let n = self.len(name)?;
        let buf = self.read_raw(name, Dtype::F32, 0, n)?;
        Ok(buf.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect())
    }

    pub fn read_i64(&mut self, name: &str) -> Result<Vec<i64>> {
        let n = self.len(name)?;
        self.read_i64_range(name, 0, n)
    }

    pub fn read_i64_range(&mut self, name: &str, start: usize, count: usize) -> Result<Vec<i64>> {
        let buf = self.read_raw(name, Dtype::I64, start, count)?;
        Ok(buf.chunks_exact(8).map(|c| i64::from_le_bytes(c.try_into().unwrap())).collect())
    }

    pub fn read_i32(&mut self, name: &str) -> Result<Vec<i32>> {
        let n = self.len(name)?;
        let buf = self.read_raw(name, Dtype::I32, 0, n)?;
        Ok(buf.chunks_exact(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect())
    }

    pub fn read_bytes(&mut self, name: &str) -> Result<Vec<u8>> {
        let n = self.len(name)?;
        self.read_raw(name, Dtype::Bytes, 0, n)
    }

    pub fn read_json<T: for<'de> Deserialize<'de>>(&mut self, name: &str) -> Result<T> {
        let buf = self.read_bytes(name)?;
        Ok(serde_json::from_slice(&buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_values_bitwise() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cpxd");

        let mut w = DataFileWriter::new();
        w.put_f64("dist", &[1.5, -2.25, 1e-300], &[3]);
        w.put_i32("row", &[0, 7, -1], &[3]);
        w.put_bytes("summary", b"{\"ok\":true}");
        w.write_to(&path).unwrap();

        let mut r = DataFileReader::open(&path).unwrap();
        assert_eq!(r.read_f64("dist").unwrap(), vec![1.5, -2.25, 1e-300]);
        assert_eq!(r.read_i32("row").unwrap(), vec![0, 7, -1]);
        assert_eq!(r.read_bytes("summary").unwrap(), b"{\"ok\":true}");
        assert_eq!(r.shape("dist").unwrap(), vec![3]);
    }

    #[test]
    fn range_reads_stream_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cpxd");

        let data: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let mut w = DataFileWriter::new();
        w.put_f64("v", &data, &[100]);
        w.write_to(&path).unwrap();

        let mut r = DataFileReader::open(&path).unwrap();
        assert_eq!(r.read_f64_range("v", 90, 10).unwrap(), data[90..].to_vec());
        assert!(r.read_f64_range("v", 95, 10).is_err());
    }

    #[test]
    fn missing_dataset_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cpxd");
        let mut w = DataFileWriter::new();
        w.put_i64("a", &[1], &[1]);
        w.write_to(&path).unwrap();

        let mut r = DataFileReader::open(&path).unwrap();
        assert!(r.read_i64("b").is_err());
    }
}
