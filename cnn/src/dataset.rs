//! Datasets in the `x_train`, `y_train`, `x_test`, `y_test` layout, read from `.npz` archives.
use std::{
    fs::File,
    io::{Read, Seek},
    path::Path,
};

use log::{debug, warn};
use ml::models::InternalDataRepresentation;
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use ndarray_npy::{NpzReader, ReadNpzError};

use crate::errors::{CnnError, CnnResult};

/// Samples along the first axis of `x`, one integer class label per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub x: InternalDataRepresentation,
    pub y: Vec<usize>,
}

impl Split {
    pub fn new(x: InternalDataRepresentation, y: Vec<usize>) -> CnnResult<Self> {
        if x.ndim() == 0 || x.len_of(Axis(0)) != y.len() {
            return Err(CnnError::DatasetShape(format!(
                "{} labels for inputs of shape {:?}",
                y.len(),
                x.shape()
            )));
        }
        Ok(Self { x, y })
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    fn truncate(&mut self, limit: usize) {
        if limit < self.len() {
            self.x = self
                .x
                .slice_axis(Axis(0), Slice::from(..limit))
                .to_owned();
            self.y.truncate(limit);
        }
    }

    fn reshape(&mut self, name: &str, input_shape: &[usize]) -> CnnResult<()> {
        if &self.x.shape()[1..] == input_shape {
            return Ok(());
        }
        let per_sample: usize = self.x.shape()[1..].iter().product();
        if per_sample != input_shape.iter().product::<usize>() {
            return Err(CnnError::DatasetShape(format!(
                "{} samples of shape {:?} do not fit the input shape {:?}",
                name,
                &self.x.shape()[1..],
                input_shape
            )));
        }
        let shape: Vec<usize> = std::iter::once(self.len())
            .chain(input_shape.iter().copied())
            .collect();
        debug!("Reshaping {} inputs to {:?}", name, shape);
        let x = std::mem::replace(&mut self.x, ArrayD::zeros(IxDyn(&[0])));
        self.x = x
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(&shape))
            .map_err(|e| CnnError::DatasetShape(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub train: Split,
    pub test: Option<Split>,
}

impl Dataset {
    pub fn new(train: Split, test: Option<Split>) -> Self {
        Self { train, test }
    }

    /// Reads `x_train` and `y_train`, and `x_test` and `y_test` if present. Inputs may be
    /// stored as f32, f64 or u8, labels as u8, i32, i64 or f32.
    pub fn from_npz<P: AsRef<Path>>(path: P) -> CnnResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| CnnError::DatasetOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = NpzReader::new(file).map_err(|source| CnnError::DatasetArray {
            name: path.display().to_string(),
            source,
        })?;
        let names = reader.names().map_err(|source| CnnError::DatasetArray {
            name: path.display().to_string(),
            source,
        })?;

        let train =
            read_split(&mut reader, &names, "train")?.ok_or(CnnError::MissingSplit("train"))?;
        let test = read_split(&mut reader, &names, "test")?;
        debug!(
            "Read dataset {}: {} training and {} test samples",
            path.display(),
            train.len(),
            test.as_ref().map_or(0, Split::len)
        );
        Ok(Self { train, test })
    }

    pub fn test(&self) -> CnnResult<&Split> {
        self.test.as_ref().ok_or(CnnError::MissingSplit("test"))
    }

    /// Multiplies every input value by `factor`, e.g. `1/255` for 8 bit images.
    pub fn rescale(&mut self, factor: f32) {
        self.splits_mut().for_each(|split| split.x *= factor);
    }

    /// Keeps at most `limit` samples per split.
    pub fn truncate(&mut self, limit: usize) {
        self.splits_mut().for_each(|split| split.truncate(limit));
    }

    /// Reshapes the samples to `input_shape` if the sizes agree, e.g. from (28, 28) to
    /// (28, 28, 1).
    pub fn reshape_inputs(&mut self, input_shape: &[usize]) -> CnnResult<()> {
        self.train.reshape("train", input_shape)?;
        if let Some(test) = self.test.as_mut() {
            test.reshape("test", input_shape)?;
        }
        Ok(())
    }

    fn splits_mut(&mut self) -> impl Iterator<Item = &mut Split> {
        std::iter::once(&mut self.train).chain(self.test.as_mut())
    }
}

fn entry<'a>(names: &'a [String], key: &str) -> Option<&'a str> {
    names
        .iter()
        .map(String::as_str)
        .find(|name| *name == key || name.strip_suffix(".npy") == Some(key))
}

fn read_split<R: Read + Seek>(
    reader: &mut NpzReader<R>,
    names: &[String],
    split: &str,
) -> CnnResult<Option<Split>> {
    let x_key = format!("x_{}", split);
    let y_key = format!("y_{}", split);
    match (entry(names, &x_key), entry(names, &y_key)) {
        (Some(x_name), Some(y_name)) => {
            let x = read_inputs(reader, x_name)?;
            let y = read_labels(reader, y_name)?;
            Ok(Some(Split::new(x, y)?))
        }
        (None, None) => Ok(None),
        (Some(_), None) => {
            warn!("Dataset has {} but no {}", x_key, y_key);
            Err(CnnError::DatasetShape(format!("{} is missing", y_key)))
        }
        (None, Some(_)) => {
            warn!("Dataset has {} but no {}", y_key, x_key);
            Err(CnnError::DatasetShape(format!("{} is missing", x_key)))
        }
    }
}

fn array_error(name: &str, source: ReadNpzError) -> CnnError {
    CnnError::DatasetArray {
        name: name.to_string(),
        source,
    }
}

fn read_inputs<R: Read + Seek>(
    reader: &mut NpzReader<R>,
    name: &str,
) -> CnnResult<InternalDataRepresentation> {
    let as_f32: Result<ArrayD<f32>, _> = reader.by_name(name);
    if let Ok(x) = as_f32 {
        return Ok(x);
    }
    let as_f64: Result<ArrayD<f64>, _> = reader.by_name(name);
    if let Ok(x) = as_f64 {
        return Ok(x.mapv(|v| v as f32));
    }
    let as_u8: ArrayD<u8> = reader.by_name(name).map_err(|e| array_error(name, e))?;
    Ok(as_u8.mapv(f32::from))
}

fn read_labels<R: Read + Seek>(reader: &mut NpzReader<R>, name: &str) -> CnnResult<Vec<usize>> {
    let as_u8: Result<ArrayD<u8>, _> = reader.by_name(name);
    if let Ok(y) = as_u8 {
        return Ok(y.iter().map(|&v| v as usize).collect());
    }
    let as_i32: Result<ArrayD<i32>, _> = reader.by_name(name);
    let as_i64: Vec<i64> = match as_i32 {
        Ok(y) => y.iter().map(|&v| v as i64).collect(),
        Err(_) => {
            let as_i64: Result<ArrayD<i64>, _> = reader.by_name(name);
            match as_i64 {
                Ok(y) => y.iter().copied().collect(),
                Err(_) => {
                    let as_f32: ArrayD<f32> =
                        reader.by_name(name).map_err(|e| array_error(name, e))?;
                    return as_f32
                        .iter()
                        .map(|&v| {
                            if v >= 0. && v.fract() == 0. {
                                Ok(v as usize)
                            } else {
                                Err(CnnError::DatasetShape(format!(
                                    "{} holds the non-integer label {}",
                                    name, v
                                )))
                            }
                        })
                        .collect();
                }
            }
        }
    };
    as_i64
        .into_iter()
        .map(|v| {
            if v >= 0 {
                Ok(v as usize)
            } else {
                Err(CnnError::DatasetShape(format!(
                    "{} holds the negative label {}",
                    name, v
                )))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};
    use ndarray_npy::NpzWriter;
    use tempfile::tempdir;

    #[test]
    fn test_reads_u8_images_and_labels() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.npz");
        let mut writer = NpzWriter::new(File::create(&path).unwrap());
        let images = Array3::<u8>::from_shape_fn((3, 2, 2), |(n, i, j)| (n * 4 + i * 2 + j) as u8);
        writer.add_array("x_train", &images).unwrap();
        writer.add_array("y_train", &array![1u8, 0, 2]).unwrap();
        writer.add_array("x_test", &images.mapv(f64::from)).unwrap();
        writer.add_array("y_test", &array![2i64, 1, 0]).unwrap();
        writer.finish().unwrap();

        let mut dataset = Dataset::from_npz(&path).unwrap();
        assert_eq!(dataset.train.y, vec![1, 0, 2]);
        assert_eq!(dataset.train.x.shape(), &[3, 2, 2]);
        assert_eq!(dataset.train.x[[2, 1, 1]], 11.);
        assert_eq!(dataset.test().unwrap().y, vec![2, 1, 0]);

        dataset.reshape_inputs(&[2, 2, 1]).unwrap();
        assert_eq!(dataset.train.x.shape(), &[3, 2, 2, 1]);
        assert_eq!(dataset.test().unwrap().x.shape(), &[3, 2, 2, 1]);

        dataset.rescale(0.5);
        assert_eq!(dataset.train.x[[2, 1, 1, 0]], 5.5);

        dataset.truncate(2);
        assert_eq!(dataset.train.len(), 2);
        assert_eq!(dataset.test().unwrap().y, vec![2, 1]);
    }

    #[test]
    fn test_missing_test_split() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.npz");
        let mut writer = NpzWriter::new(File::create(&path).unwrap());
        writer
            .add_array("x_train", &Array3::<f32>::zeros((2, 2, 2)))
            .unwrap();
        writer.add_array("y_train", &array![0i32, 1]).unwrap();
        writer.finish().unwrap();

        let dataset = Dataset::from_npz(&path).unwrap();
        assert!(dataset.test.is_none());
        assert!(matches!(dataset.test(), Err(CnnError::MissingSplit("test"))));
    }

    #[test]
    fn test_label_count_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.npz");
        let mut writer = NpzWriter::new(File::create(&path).unwrap());
        writer
            .add_array("x_train", &Array3::<f32>::zeros((2, 2, 2)))
            .unwrap();
        writer.add_array("y_train", &array![0u8]).unwrap();
        writer.finish().unwrap();

        assert!(matches!(
            Dataset::from_npz(&path),
            Err(CnnError::DatasetShape(_))
        ));
    }

    #[test]
    fn test_reshape_rejects_other_sizes() {
        let split = Split::new(ArrayD::zeros(IxDyn(&[2, 3, 3])), vec![0, 1]).unwrap();
        let mut dataset = Dataset::new(split, None);
        assert!(dataset.reshape_inputs(&[2, 2, 1]).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Dataset::from_npz("/definitely/not/here.npz"),
            Err(CnnError::DatasetOpen { .. })
        ));
    }
}
