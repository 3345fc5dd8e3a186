use crate::WeightPrecision;
use ndarray::{Array, ArrayD, IxDyn, ShapeError};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError, WriteNpzError};
use serde_derive::{Deserialize, Serialize};
use serde_json::{self, Map, Value};
use std::io::{BufWriter, Read, Seek};
use std::{fs, path::Path};
use thiserror::Error;

pub type WeightResult<T> = Result<T, WeightError>;

#[derive(Error, Debug)]
pub enum WeightError {
    #[error("No weights with name {0} found")]
    WeightKeyError(String),
    #[error("Weight file didn't have the correct format (required: JSON dict of pairs (key, flattened array of weights))")]
    WeightFormatError,
    #[error("Weight file not found. Filesystem reported error\n {0}.")]
    WeightFileNotFoundError(#[from] std::io::Error),
    #[error("Weight file not readable. Filesystem reported error\n {0}.")]
    WeightFileNpzError(#[from] ReadNpzError),
    #[error("Weight file not writable. Filesystem reported error\n {0}.")]
    WeightFileNpzWriteError(#[from] WriteNpzError),
    #[error("Weight file could not be serialized: {0}")]
    WeightFileJsonError(#[from] serde_json::Error),
    #[error("Wrong shape for weight:\n {0}.")]
    WeightShapeError(#[from] ShapeError),
    #[error("Weight {name} has shape {found:?}, expected {expected:?}")]
    WeightShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// Source of named weight tensors.
pub trait WeightLoader {
    fn get_weight(&mut self, param_name: &str, shape: &[usize])
        -> WeightResult<ArrayD<WeightPrecision>>;
}

/// On-disk layout used for checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightFormat {
    Npz,
    Json,
}

impl Default for WeightFormat {
    fn default() -> Self {
        WeightFormat::Npz
    }
}

impl WeightFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            WeightFormat::Npz => "npz",
            WeightFormat::Json => "json",
        }
    }

    /// Writes all given weights to `path`, replacing an existing file.
    pub fn save<P: AsRef<Path>>(
        &self,
        path: P,
        weights: &[(&str, &ArrayD<WeightPrecision>)],
    ) -> WeightResult<()> {
        match self {
            WeightFormat::Npz => save_npz(path, weights),
            WeightFormat::Json => save_json(path, weights),
        }
    }

    pub fn loader<P: AsRef<Path>>(&self, path: P) -> WeightResult<Box<dyn WeightLoader>> {
        Ok(match self {
            WeightFormat::Npz => Box::new(NpzWeightLoader::from_path(path)?),
            WeightFormat::Json => Box::new(JsonWeightLoader::new(path)?),
        })
    }
}

fn check_shape(
    param_name: &str,
    weights: ArrayD<WeightPrecision>,
    shape: &[usize],
) -> WeightResult<ArrayD<WeightPrecision>> {
    if weights.shape() != shape {
        return Err(WeightError::WeightShapeMismatch {
            name: param_name.to_string(),
            expected: shape.to_vec(),
            found: weights.shape().to_vec(),
        });
    }
    Ok(weights)
}

pub struct JsonWeightLoader {
    content: Map<String, Value>,
}

impl JsonWeightLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> WeightResult<JsonWeightLoader> {
        let raw_file = fs::read_to_string(path)?;
        let parsed: Value =
            serde_json::from_str(&raw_file).map_err(|_| WeightError::WeightFormatError)?;
        let content = match parsed {
            Value::Object(content) => content,
            _ => return Err(WeightError::WeightFormatError),
        };
        Ok(JsonWeightLoader { content })
    }
}

impl WeightLoader for JsonWeightLoader {
    /// Returns weights with the given name from the weight loader. Weights are stored in a FLATTENED form
    /// (to facilitate working with JSON, as then all arrays have the same length.)
    fn get_weight(
        &mut self,
        param_name: &str,
        shape: &[usize],
    ) -> WeightResult<ArrayD<WeightPrecision>> {
        let raw_arr = self
            .content
            .get(param_name)
            .ok_or_else(|| WeightError::WeightKeyError(param_name.to_string()))?;

        let raw_value_vector = match raw_arr {
            Value::Array(v) => v,
            _ => return Err(WeightError::WeightFormatError),
        };

        let weight_vector: Result<Vec<_>, _> = raw_value_vector
            .iter()
            .map(|j| {
                j.as_f64()
                    .map(|v| v as WeightPrecision)
                    .ok_or(WeightError::WeightFormatError)
            })
            .collect();

        let weights = Array::from_shape_vec(IxDyn(shape), weight_vector?)?;

        Ok(weights)
    }
}

pub struct NpzWeightLoader<R>
where
    R: Seek + Read,
{
    handle: R,
    names: Vec<String>,
}

impl NpzWeightLoader<std::fs::File> {
    pub fn from_path<P: AsRef<Path>>(path: P) -> WeightResult<NpzWeightLoader<std::fs::File>> {
        let mut handle = std::fs::File::open(path)?;
        let names = NpzReader::new(&mut handle)?.names()?;
        Ok(NpzWeightLoader { handle, names })
    }
}

impl<R> NpzWeightLoader<R>
where
    R: Seek + Read,
{
    /// Archive entries may or may not carry the `.npy` suffix depending on the writer.
    fn entry_name(&self, param_name: &str) -> Option<&str> {
        self.names
            .iter()
            .map(|name| name.as_str())
            .find(|name| *name == param_name || name.strip_suffix(".npy") == Some(param_name))
    }
}

impl<R> WeightLoader for NpzWeightLoader<R>
where
    R: Seek + Read,
{
    fn get_weight(
        &mut self,
        param_name: &str,
        shape: &[usize],
    ) -> WeightResult<ArrayD<WeightPrecision>> {
        let entry = self
            .entry_name(param_name)
            .ok_or_else(|| WeightError::WeightKeyError(param_name.to_string()))?
            .to_string();

        // The reader in the npy package has to be mut, so we recreate it on every call.
        let mut reader = NpzReader::new(&mut self.handle)?;
        let arr: ArrayD<WeightPrecision> = reader.by_name(&entry)?;

        check_shape(param_name, arr, shape)
    }
}

fn save_npz<P: AsRef<Path>>(
    path: P,
    weights: &[(&str, &ArrayD<WeightPrecision>)],
) -> WeightResult<()> {
    let file = fs::File::create(path)?;
    let mut npz = NpzWriter::new(file);
    for (name, weight) in weights {
        npz.add_array(*name, *weight)?;
    }
    npz.finish()?;
    Ok(())
}

fn save_json<P: AsRef<Path>>(
    path: P,
    weights: &[(&str, &ArrayD<WeightPrecision>)],
) -> WeightResult<()> {
    let mut content = Map::new();
    for (name, weight) in weights {
        let flattened = weight.iter().map(|&w| Value::from(w as f64)).collect();
        content.insert(name.to_string(), Value::Array(flattened));
    }
    let writer = BufWriter::new(fs::File::create(path)?);
    serde_json::to_writer(writer, &Value::Object(content))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;

    use super::*;
    use ndarray::{array, Array1, Array2};
    use tempfile::tempdir;

    #[test]
    fn test_json_weight_loader() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("temp-weights.txt");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            // Rust escapes curly braces by doubling them
            "{{ \"arr1\": [0.0, 1e-3, 1.0], \"arr2\": [0.0, 1.0, 2.0, 3.0]}}"
        )
        .unwrap();

        let mut loader = JsonWeightLoader::new(file_path).unwrap();

        assert_eq!(
            loader.get_weight("arr1", &[3]).unwrap(),
            array![0.0, 1e-3, 1.0].into_dyn()
        );
        assert_eq!(
            loader.get_weight("arr2", &[2, 2]).unwrap(),
            array![[0.0, 1.0], [2.0, 3.0]].into_dyn()
        );
        assert!(matches!(
            loader.get_weight("arr3", &[1]),
            Err(WeightError::WeightKeyError(_))
        ));

        drop(file);
        dir.close().unwrap();
    }

    #[test]
    fn test_json_weight_loader_rejects_non_dict() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("list.json");
        fs::write(&file_path, "[1.0, 2.0]").unwrap();

        assert!(matches!(
            JsonWeightLoader::new(&file_path),
            Err(WeightError::WeightFormatError)
        ));
    }

    #[test]
    fn test_npz_weight_loader() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("temp-weights.npz");
        let file = File::create(&file_path).unwrap();
        let mut npz = ndarray_npy::NpzWriter::new(file);
        let a: Array2<f32> = array![[1., 2., 3.], [4., 5., 6.]];
        let b: Array1<f32> = array![7., 8., 9.];
        npz.add_array("a", &a).unwrap();
        npz.add_array("b", &b).unwrap();
        npz.finish().unwrap();

        let mut loader = NpzWeightLoader::from_path(file_path).unwrap();

        assert_eq!(loader.get_weight("a", &[2, 3]).unwrap(), a.into_dyn());
        assert_eq!(loader.get_weight("b", &[3]).unwrap(), b.into_dyn());
        assert!(matches!(
            loader.get_weight("b", &[1, 3]),
            Err(WeightError::WeightShapeMismatch { .. })
        ));

        dir.close().unwrap();
    }

    #[test]
    fn test_formats_write_what_they_read() {
        let dir = tempdir().unwrap();
        let kernel = array![[0.5f32, -1.25], [3.0, 0.1]].into_dyn();
        let bias = array![0.0f32, 2.5].into_dyn();
        let weights = [("SkipLayer_1/Conv1/kernel", &kernel), ("SkipLayer_1/Conv1/bias", &bias)];

        for format in &[WeightFormat::Npz, WeightFormat::Json] {
            let path = dir.path().join(format!("weights.{}", format.extension()));
            format.save(&path, &weights).unwrap();

            let mut loader = format.loader(&path).unwrap();
            assert_eq!(
                loader.get_weight("SkipLayer_1/Conv1/kernel", &[2, 2]).unwrap(),
                kernel
            );
            assert_eq!(loader.get_weight("SkipLayer_1/Conv1/bias", &[2]).unwrap(), bias);
        }
    }
}
