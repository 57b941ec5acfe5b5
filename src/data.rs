//! Dataset manifests and learning-rate schedules.
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::info;
use tch::{Device, Kind, Tensor};

use crate::{FaceEmbedError, Result};

/// Rate used when no schedule line applies yet.
pub const DEFAULT_LEARNING_RATE: f64 = 0.1;

/// Image paths and their labels, as listed in a manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub paths: Vec<PathBuf>,
    pub labels: Vec<i64>,
    /// Number of distinct labels.
    pub num_classes: usize,
}

impl Dataset {
    /// Parses manifest lines of the form `<relative-image-path> <label>`.
    ///
    /// Paths are joined onto `data_dir` and labels are shifted by `offset`,
    /// so that several manifests can share one label space.
    pub fn from_reader<R: BufRead>(data_dir: &Path, reader: R, offset: i64) -> Result<Dataset> {
        Dataset::parse(data_dir, reader, offset, "manifest")
    }

    fn parse<R: BufRead>(data_dir: &Path, reader: R, offset: i64, source: &str) -> Result<Dataset> {
        let mut paths = vec![];
        let mut labels = vec![];
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let mut items = line.split_whitespace();
            let path = match items.next() {
                None => continue,
                Some(path) => path,
            };
            let label = items.next().ok_or_else(|| {
                FaceEmbedError::FileFormat(format!("missing label for {path}"))
                    .line_context(source, index + 1)
            })?;
            paths.push(data_dir.join(path));
            labels.push(offset + label.parse::<i64>()?);
        }
        Ok(Dataset::new(paths, labels))
    }

    pub fn new(paths: Vec<PathBuf>, labels: Vec<i64>) -> Dataset {
        let num_classes = labels.iter().collect::<BTreeSet<_>>().len();
        Dataset { paths, labels, num_classes }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Appends another dataset; labels are kept as they are.
    pub fn merge(mut self, other: Dataset) -> Dataset {
        self.paths.extend(other.paths);
        self.labels.extend(other.labels);
        Dataset::new(self.paths, self.labels)
    }

    pub fn labels_tensor(&self) -> Tensor {
        Tensor::from_slice(&self.labels)
    }

    /// Iterates over batches of `(paths, labels)`.
    pub fn iter(&self, batch_size: i64) -> Iter<'_> {
        Iter::new(self, batch_size)
    }
}

/// Reads the manifest at `imglist_path`.
pub fn get_datasets<P: AsRef<Path>, Q: AsRef<Path>>(
    data_dir: P,
    imglist_path: Q,
    offset: i64,
) -> Result<Dataset> {
    let imglist_path = imglist_path.as_ref();
    let file = File::open(imglist_path)?;
    let source = imglist_path.display().to_string();
    let dataset = Dataset::parse(data_dir.as_ref(), BufReader::new(file), offset, &source)?;
    info!(
        "{}: {} images, {} classes (offset {offset})",
        imglist_path.display(),
        dataset.len(),
        dataset.num_classes
    );
    Ok(dataset)
}

/// A piecewise-constant learning rate, one `<epoch>:<rate>` entry per line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearningRateSchedule {
    entries: Vec<(i64, f64)>,
}

impl LearningRateSchedule {
    pub fn from_reader<R: BufRead>(reader: R) -> Result<LearningRateSchedule> {
        LearningRateSchedule::parse(reader, "learning rate schedule")
    }

    fn parse<R: BufRead>(reader: R, source: &str) -> Result<LearningRateSchedule> {
        let mut entries = vec![];
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (epoch, rate) = line.split_once(':').ok_or_else(|| {
                FaceEmbedError::FileFormat(format!("expected <epoch>:<rate>, got {line:?}"))
                    .line_context(source, index + 1)
            })?;
            entries.push((epoch.trim().parse::<i64>()?, rate.trim().parse::<f64>()?));
        }
        Ok(LearningRateSchedule { entries })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<LearningRateSchedule> {
        let path = path.as_ref();
        let file = File::open(path)?;
        LearningRateSchedule::parse(BufReader::new(file), &path.display().to_string())
    }

    /// The rate of the last line whose epoch is at most `epoch`. Every line
    /// is looked at, so entries do not need to be sorted.
    pub fn rate(&self, epoch: i64) -> f64 {
        let mut learning_rate = DEFAULT_LEARNING_RATE;
        for &(e, lr) in self.entries.iter() {
            if e <= epoch {
                learning_rate = lr;
            }
        }
        learning_rate
    }
}

/// Reads the schedule in `filename` and returns the rate for `epoch`.
pub fn get_learning_rate_from_file<P: AsRef<Path>>(filename: P, epoch: i64) -> Result<f64> {
    Ok(LearningRateSchedule::from_file(filename)?.rate(epoch))
}

/// An iterator over batches of a dataset.
/// Each batch is a (potentially random) slice of the image paths and the
/// matching labels.
#[derive(Debug)]
pub struct Iter<'a> {
    dataset: &'a Dataset,
    labels: Tensor,
    /// Dataset index of every position, permuted by `shuffle`.
    order: Tensor,
    batch_index: i64,
    batch_size: i64,
    return_smaller_last_batch: bool,
}

impl<'a> Iter<'a> {
    pub fn new(dataset: &'a Dataset, batch_size: i64) -> Iter<'a> {
        Iter {
            dataset,
            labels: dataset.labels_tensor(),
            order: Tensor::arange(dataset.len() as i64, (Kind::Int64, Device::Cpu)),
            batch_index: 0,
            batch_size,
            return_smaller_last_batch: false,
        }
    }

    pub fn shuffle(&mut self) -> &mut Iter<'a> {
        let index = Tensor::randperm(self.dataset.len() as i64, (Kind::Int64, Device::Cpu));
        self.order = self.order.index_select(0, &index);
        self
    }

    pub fn return_smaller_last_batch(&mut self) -> &mut Iter<'a> {
        self.return_smaller_last_batch = true;
        self
    }
}

impl Iterator for Iter<'_> {
    type Item = (Vec<PathBuf>, Tensor);

    fn next(&mut self) -> Option<Self::Item> {
        let total_size = self.dataset.len() as i64;
        let start = self.batch_index * self.batch_size;
        let size = std::cmp::min(self.batch_size, total_size - start);
        if size <= 0 || (!self.return_smaller_last_batch && size < self.batch_size) {
            None
        } else {
            self.batch_index += 1;
            let indexes = self.order.narrow(0, start, size);
            let paths = (0..size)
                .map(|i| self.dataset.paths[indexes.int64_value(&[i]) as usize].clone())
                .collect();
            Some((paths, self.labels.index_select(0, &indexes)))
        }
    }
}
