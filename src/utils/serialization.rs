//! # Optimizer Serialization Utilities
//!
//! Keyed archives for saving and loading optimizer state. An archive is a
//! flat map from string keys to either tensors or arbitrary `serde` values,
//! encoded with `bincode`. What goes under which key is decided by each
//! optimizer's `save`/`load`; the archive only stores and retrieves.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::OptimError;
use crate::optim::OptimizerCore;
use crate::tensor::{DType, Device, Storage, Tensor};

// --- Error Type ---
#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization Error (Bincode): {0}")]
    Bincode(#[from] bincode::Error),
    #[error(
        "Tensor shape mismatch during loading: key '{key}', expected {expected:?}, got {got:?}"
    )]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Missing key in archive: '{0}'")]
    MissingKey(String),
    #[error("Archive entry '{key}' is not a {expected}")]
    WrongEntryKind { key: String, expected: &'static str },
    #[error("Archive key '{key}' was written for {got} parameters, optimizer has {expected}")]
    ParameterCountMismatch {
        key: String,
        expected: usize,
        got: usize,
    },
    #[error("Corrupt tensor under '{key}': {reason}")]
    CorruptTensor { key: String, reason: String },
}

// --- Serializable Tensor Wrapper ---

/// Values are widened to `f64`, which is lossless for both dtypes.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct SerializableTensor {
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
    data: Vec<f64>,
}

impl SerializableTensor {
    fn from_tensor(tensor: &Tensor) -> Self {
        SerializableTensor {
            shape: tensor.shape().to_vec(),
            dtype: tensor.dtype(),
            device: tensor.device(),
            data: tensor.to_vec(),
        }
    }

    fn to_tensor(&self, key: &str) -> Result<Tensor, SerializationError> {
        let storage = Storage::from_vec(&self.shape, self.data.clone(), self.dtype).map_err(|e| {
            SerializationError::CorruptTensor {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Tensor::from_storage(storage, self.device, false))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
enum ArchiveEntry {
    Tensor(SerializableTensor),
    Value(Vec<u8>),
}

// Use BTreeMap for consistent ordering (helpful for diffs/debugging).
type Entries = BTreeMap<String, ArchiveEntry>;

// --- Output Archive ---

/// Archive being written. Writing a key twice keeps the last value.
#[derive(Debug, Default)]
pub struct OutputArchive {
    entries: Entries,
}

impl OutputArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a copy of `tensor`'s values, shape, dtype and device.
    pub fn write_tensor(&mut self, key: &str, tensor: &Tensor) {
        let entry = ArchiveEntry::Tensor(SerializableTensor::from_tensor(tensor));
        self.entries.insert(key.to_string(), entry);
    }

    pub fn write_value<T: Serialize>(
        &mut self,
        key: &str,
        value: &T,
    ) -> Result<(), SerializationError> {
        let bytes = bincode::serialize(value)?;
        self.entries.insert(key.to_string(), ArchiveEntry::Value(bytes));
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        Ok(bincode::serialize(&self.entries)?)
    }

    /// Writes the archive to `path`, replacing any existing file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), SerializationError> {
        let file = File::create(path.as_ref())?;
        let writer = BufWriter::new(file);
        bincode::serialize_into(writer, &self.entries)?;
        debug!("wrote {} archive entries to {}", self.entries.len(), path.as_ref().display());
        Ok(())
    }

    /// Reopens the written entries for reading without a byte round trip.
    pub fn into_input(self) -> InputArchive {
        InputArchive { entries: self.entries }
    }
}

// --- Input Archive ---

/// Archive being read.
#[derive(Debug, Default)]
pub struct InputArchive {
    entries: Entries,
}

impl InputArchive {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        let entries: Entries = bincode::deserialize(bytes)?;
        Ok(InputArchive { entries })
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, SerializationError> {
        let file = File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let entries: Entries = bincode::deserialize_from(reader)?;
        debug!("read {} archive entries from {}", entries.len(), path.as_ref().display());
        Ok(InputArchive { entries })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, key: &str) -> Result<&ArchiveEntry, SerializationError> {
        self.entries
            .get(key)
            .ok_or_else(|| SerializationError::MissingKey(key.to_string()))
    }

    /// Reads a tensor into fresh storage with its saved dtype and device.
    pub fn read_tensor(&self, key: &str) -> Result<Tensor, SerializationError> {
        match self.entry(key)? {
            ArchiveEntry::Tensor(tensor) => tensor.to_tensor(key),
            ArchiveEntry::Value(_) => Err(SerializationError::WrongEntryKind {
                key: key.to_string(),
                expected: "tensor",
            }),
        }
    }

    /// Reads the tensor saved for `like`, if there is one.
    ///
    /// The saved shape must equal `like`'s; the result is moved to `like`'s
    /// device and dtype.
    pub fn read_tensor_for(
        &self,
        key: &str,
        like: &Tensor,
    ) -> Result<Option<Tensor>, SerializationError> {
        if !self.contains(key) {
            return Ok(None);
        }
        let tensor = self.read_tensor(key)?;
        if tensor.shape() != like.shape() {
            return Err(SerializationError::ShapeMismatch {
                key: key.to_string(),
                expected: like.shape().to_vec(),
                got: tensor.shape().to_vec(),
            });
        }
        if tensor.device() != like.device() || tensor.dtype() != like.dtype() {
            return Ok(Some(tensor.to(like.device(), like.dtype())));
        }
        Ok(Some(tensor))
    }

    pub fn read_value<T: DeserializeOwned>(&self, key: &str) -> Result<T, SerializationError> {
        match self.entry(key)? {
            ArchiveEntry::Value(bytes) => Ok(bincode::deserialize(bytes)?),
            ArchiveEntry::Tensor(_) => Err(SerializationError::WrongEntryKind {
                key: key.to_string(),
                expected: "value",
            }),
        }
    }
}

// --- Stream-style Wrappers ---

/// Serializes `optimizer` into `archive`; same as `optimizer.save(archive)`.
pub fn save_optimizer<'a, T>(
    archive: &'a mut OutputArchive,
    optimizer: &T,
) -> Result<&'a mut OutputArchive, OptimError>
where
    T: OptimizerCore + ?Sized,
{
    optimizer.save(archive)?;
    Ok(archive)
}

/// Deserializes `optimizer` from `archive`; same as `optimizer.load(archive)`.
pub fn load_optimizer<'a, T>(
    archive: &'a InputArchive,
    optimizer: &mut T,
) -> Result<&'a InputArchive, OptimError>
where
    T: OptimizerCore + ?Sized,
{
    optimizer.load(archive)?;
    Ok(archive)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(values: &[f64], dtype: DType) -> Tensor {
        Tensor::from_vec(&[values.len()], values.to_vec(), dtype, false).unwrap()
    }

    #[test]
    fn bytes_round_trip() {
        let mut out = OutputArchive::new();
        out.write_tensor("t", &tensor(&[1.0, 2.5], DType::F32).to(Device::Gpu(2), DType::F32));
        out.write_value("count", &3usize).unwrap();
        let bytes = out.to_bytes().unwrap();

        let input = InputArchive::from_bytes(&bytes).unwrap();
        let t = input.read_tensor("t").unwrap();
        assert_eq!(t.to_vec(), vec![1.0, 2.5]);
        assert_eq!(t.device(), Device::Gpu(2));
        assert_eq!(t.dtype(), DType::F32);
        assert_eq!(input.read_value::<usize>("count").unwrap(), 3);
    }

    #[test]
    fn file_round_trip() {
        let name = format!("rtorch-optim-archive-{}.bin", std::process::id());
        let path = std::env::temp_dir().join(name);
        let mut out = OutputArchive::new();
        out.write_value("lr", &0.5f64).unwrap();
        out.save_to_file(&path).unwrap();

        let input = InputArchive::load_from_file(&path).unwrap();
        assert_eq!(input.read_value::<f64>("lr").unwrap(), 0.5);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_and_mistyped_keys() {
        let mut out = OutputArchive::new();
        out.write_value("v", &1u8).unwrap();
        out.write_tensor("t", &tensor(&[1.0], DType::F64));
        let input = out.into_input();

        assert!(matches!(input.read_tensor("nope"), Err(SerializationError::MissingKey(_))));
        assert!(matches!(input.read_tensor("v"), Err(SerializationError::WrongEntryKind { .. })));
        assert!(matches!(
            input.read_value::<u8>("t"),
            Err(SerializationError::WrongEntryKind { .. })
        ));
    }

    #[test]
    fn read_tensor_for_checks_shape_and_coerces() {
        let mut out = OutputArchive::new();
        out.write_tensor("t", &tensor(&[1.0, 2.0], DType::F32));
        let input = out.into_input();

        let like = tensor(&[0.0, 0.0], DType::F64).to(Device::Gpu(0), DType::F64);
        let read = input.read_tensor_for("t", &like).unwrap().unwrap();
        assert_eq!(read.dtype(), DType::F64);
        assert_eq!(read.device(), Device::Gpu(0));

        let wrong = tensor(&[0.0], DType::F32);
        assert!(matches!(
            input.read_tensor_for("t", &wrong),
            Err(SerializationError::ShapeMismatch { .. })
        ));
        assert!(input.read_tensor_for("absent", &wrong).unwrap().is_none());
    }
}
