//! Dataset selection and loading. Images are `(N, C, H, W)` f32 tensors in
//! `[-1, 1]`; labels are i64 class indices, with negative values meaning
//! "label unknown".

use std::path::Path;
use std::str::FromStr;

use candle::{Device, Result, Tensor};
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const CIFAR_SIZE: usize = 32;
const CIFAR_RECORD: usize = 1 + 3 * CIFAR_SIZE * CIFAR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WhichDataset {
    Cifar,
    Afhq,
    Imagenet,
    Imagenet64,
}

impl WhichDataset {
    /// Number of label classes; zero means the dataset is unconditional.
    pub fn num_classes(&self) -> usize {
        match self {
            Self::Cifar => 10,
            Self::Afhq => 3,
            Self::Imagenet => 1000,
            Self::Imagenet64 => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cifar => "cifar",
            Self::Afhq => "afhq",
            Self::Imagenet => "imagenet",
            Self::Imagenet64 => "imagenet64",
        }
    }

    /// Load the training split from `data_dir/<name>`.
    pub fn load<P: AsRef<Path>>(
        &self,
        data_dir: P,
        img_size: usize,
        device: &Device,
    ) -> Result<ImageDataset> {
        let dir = data_dir.as_ref().join(self.name());
        match self {
            Self::Cifar => load_cifar(&dir, img_size, device),
            _ => load_image_folder(&dir, img_size, device),
        }
    }
}

impl std::fmt::Display for WhichDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WhichDataset {
    type Err = candle::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cifar" => Ok(Self::Cifar),
            "afhq" => Ok(Self::Afhq),
            "imagenet" => Ok(Self::Imagenet),
            "imagenet64" => Ok(Self::Imagenet64),
            _ => candle::bail!("unknown dataset {s}"),
        }
    }
}

/// An in-memory labeled image dataset.
pub struct ImageDataset {
    images: Tensor,
    labels: Tensor,
}

impl ImageDataset {
    pub fn new(images: Tensor, labels: Tensor) -> Result<Self> {
        let (n, _c, _h, _w) = images.dims4()?;
        if labels.dims1()? != n {
            candle::bail!(
                "{} labels for {n} images",
                labels.dims1()?
            )
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.images.dim(0).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn images(&self) -> &Tensor {
        &self.images
    }

    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    /// Split into `(images, labels)` batches, including a final partial batch.
    /// With a seed the sample order is shuffled, deterministically per seed.
    pub fn batches(
        &self,
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> Result<Vec<(Tensor, Tensor)>> {
        if batch_size == 0 {
            candle::bail!("batch size must be positive")
        }
        let mut order = (0..self.len() as u32).collect::<Vec<_>>();
        if let Some(seed) = shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed);
            order.shuffle(&mut rng);
        }
        let device = self.images.device();
        let mut out = Vec::with_capacity(order.len().div_ceil(batch_size));
        for chunk in order.chunks(batch_size) {
            let idx = Tensor::from_vec(chunk.to_vec(), chunk.len(), device)?;
            out.push((
                self.images.index_select(&idx, 0)?,
                self.labels.index_select(&idx, 0)?,
            ));
        }
        Ok(out)
    }
}

/// CIFAR-10 from the binary distribution: `data_batch_{1..5}.bin`, each
/// record one label byte followed by 3072 channel-major pixel bytes.
fn load_cifar(dir: &Path, img_size: usize, device: &Device) -> Result<ImageDataset> {
    if img_size != CIFAR_SIZE {
        candle::bail!("cifar images are {CIFAR_SIZE}x{CIFAR_SIZE}, requested {img_size}")
    }
    let mut pixels = Vec::new();
    let mut labels = Vec::new();
    for batch in 1..=5 {
        let path = dir.join(format!("data_batch_{batch}.bin"));
        let bytes = std::fs::read(&path)
            .map_err(|err| candle::Error::Msg(format!("{}: {err}", path.display())))?;
        if bytes.len() % CIFAR_RECORD != 0 {
            candle::bail!("{} is not a whole number of records", path.display())
        }
        for record in bytes.chunks_exact(CIFAR_RECORD) {
            labels.push(record[0] as i64);
            pixels.extend(record[1..].iter().map(|&b| b as f32 / 255. * 2. - 1.));
        }
    }
    let n = labels.len();
    let images = Tensor::from_vec(pixels, (n, 3, CIFAR_SIZE, CIFAR_SIZE), device)?;
    let labels = Tensor::from_vec(labels, n, device)?;
    ImageDataset::new(images, labels)
}

/// A directory of class subdirectories, each holding image files. Class
/// indices follow the lexicographic order of the subdirectory names.
fn load_image_folder(dir: &Path, img_size: usize, device: &Device) -> Result<ImageDataset> {
    let mut class_dirs = std::fs::read_dir(dir)
        .map_err(|err| candle::Error::Msg(format!("{}: {err}", dir.display())))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect::<Vec<_>>();
    class_dirs.sort();
    if class_dirs.is_empty() {
        candle::bail!("no class directories under {}", dir.display())
    }
    let mut pixels = Vec::new();
    let mut labels = Vec::new();
    for (class, class_dir) in class_dirs.iter().enumerate() {
        let mut files = std::fs::read_dir(class_dir)
            .map_err(|err| candle::Error::Msg(format!("{}: {err}", class_dir.display())))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        files.sort();
        for file in files {
            let img = image::open(&file)
                .map_err(|err| candle::Error::Msg(format!("{}: {err}", file.display())))?
                .resize_to_fill(img_size as u32, img_size as u32, FilterType::Triangle)
                .to_rgb8();
            let raw = img.into_raw();
            // HWC bytes to CHW floats.
            for c in 0..3 {
                pixels.extend(
                    raw.chunks_exact(3)
                        .map(|px| px[c] as f32 / 255. * 2. - 1.),
                );
            }
            labels.push(class as i64);
        }
    }
    let n = labels.len();
    let images = Tensor::from_vec(pixels, (n, 3, img_size, img_size), device)?;
    let labels = Tensor::from_vec(labels, n, device)?;
    ImageDataset::new(images, labels)
}
