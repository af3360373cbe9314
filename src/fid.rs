//! FID bookkeeping: feature-moment accumulation for real and generated
//! images, snapshot save/restore, and the Frechet distance between the two
//! accumulated Gaussians. The image-embedding network behind the features is
//! an opaque collaborator reached through [`ImageEmbedder`].

use std::collections::HashMap;
use std::path::Path;

use candle::{DType, Device, Result, Tensor, D};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder};

use crate::linalg;

/// A fixed image-embedding network mapping `[0, 1]` images `(N, C, H, W)` to
/// feature vectors `(N, dim)`.
pub trait ImageEmbedder {
    fn embed(&self, images: &Tensor) -> Result<Tensor>;
    fn dim(&self) -> usize;
}

/// A small strided conv net with global average pooling. Stands in for the
/// usual Inception features; the weights are fixed (loaded or seeded), never
/// trained.
pub struct ConvEmbedder {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    dim: usize,
}

impl ConvEmbedder {
    pub fn new(in_channels: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv1 = conv2d(in_channels, dim / 2, 3, cfg, vb.pp("conv1"))?;
        let conv2 = conv2d(dim / 2, dim, 3, cfg, vb.pp("conv2"))?;
        let conv3 = conv2d(dim, dim, 3, cfg, vb.pp("conv3"))?;
        Ok(Self {
            conv1,
            conv2,
            conv3,
            dim,
        })
    }
}

impl ImageEmbedder for ConvEmbedder {
    fn embed(&self, images: &Tensor) -> Result<Tensor> {
        let x = self.conv1.forward(images)?.relu()?;
        let x = self.conv2.forward(&x)?.relu()?;
        let x = self.conv3.forward(&x)?;
        // Global average pool over the spatial dims.
        x.mean(D::Minus1)?.mean(D::Minus1)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Running first and second moments of one feature split.
#[derive(Debug, Clone)]
struct Moments {
    count: usize,
    sum: Vec<f64>,
    outer: Vec<f64>,
}

impl Moments {
    fn new(dim: usize) -> Self {
        Self {
            count: 0,
            sum: vec![0.; dim],
            outer: vec![0.; dim * dim],
        }
    }

    fn update(&mut self, features: &[Vec<f32>]) {
        let dim = self.sum.len();
        for row in features {
            self.count += 1;
            for i in 0..dim {
                let fi = row[i] as f64;
                self.sum[i] += fi;
                for j in 0..dim {
                    self.outer[i * dim + j] += fi * row[j] as f64;
                }
            }
        }
    }

    /// Sample mean and unbiased covariance.
    fn mean_cov(&self) -> Result<(Vec<f64>, Vec<f64>)> {
        let dim = self.sum.len();
        if self.count < 2 {
            candle::bail!("need at least 2 samples, have {}", self.count)
        }
        let n = self.count as f64;
        let mean = self.sum.iter().map(|s| s / n).collect::<Vec<_>>();
        let mut cov = vec![0.; dim * dim];
        for i in 0..dim {
            for j in 0..dim {
                cov[i * dim + j] =
                    (self.outer[i * dim + j] - n * mean[i] * mean[j]) / (n - 1.);
            }
        }
        Ok((mean, cov))
    }
}

/// Accumulated FID statistics for the real and generated splits.
#[derive(Debug, Clone)]
pub struct FidStats {
    dim: usize,
    real: Moments,
    fake: Moments,
}

/// Name of the persisted reference-statistics file for a dataset.
pub fn stats_file_name(dataset: &str, img_size: usize) -> String {
    format!("{dataset}_{img_size}_fid_stats.safetensors")
}

impl FidStats {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            real: Moments::new(dim),
            fake: Moments::new(dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn real_count(&self) -> usize {
        self.real.count
    }

    pub fn fake_count(&self) -> usize {
        self.fake.count
    }

    /// Fold a batch of feature vectors `(N, dim)` into the chosen split.
    pub fn update(&mut self, features: &Tensor, real: bool) -> Result<()> {
        let (_, dim) = features.dims2()?;
        if dim != self.dim {
            candle::bail!("feature dim {dim} does not match stats dim {}", self.dim)
        }
        let rows = features.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let split = if real { &mut self.real } else { &mut self.fake };
        split.update(&rows);
        Ok(())
    }

    /// Reset only the generated split, keeping the reference statistics.
    pub fn reset_fake(&mut self) {
        self.fake = Moments::new(self.dim);
    }

    /// Frechet distance between the two accumulated Gaussians:
    /// `|mu_r - mu_f|^2 + Tr(S_r + S_f - 2 (S_r S_f)^1/2)`.
    pub fn frechet_distance(&self) -> Result<f64> {
        let dim = self.dim;
        let (mean_r, cov_r) = self.real.mean_cov()?;
        let (mean_f, cov_f) = self.fake.mean_cov()?;
        let mean_term = mean_r
            .iter()
            .zip(mean_f.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>();
        let trace = |m: &[f64]| (0..dim).map(|i| m[i * dim + i]).sum::<f64>();
        // Tr((S_r S_f)^1/2) computed symmetrically as
        // Tr((S_r^1/2 S_f S_r^1/2)^1/2) so the eigen routine stays on
        // symmetric matrices.
        let root_r = linalg::sqrtm_psd(&cov_r, dim)?;
        let inner = linalg::matmul_host(&linalg::matmul_host(&root_r, &cov_f, dim), &root_r, dim);
        let cross = trace(&linalg::sqrtm_psd(&inner, dim)?);
        Ok(mean_term + trace(&cov_r) + trace(&cov_f) - 2. * cross)
    }

    /// Persist the accumulated state. Refuses to overwrite: recomputing
    /// reference statistics over an existing file is a fatal misuse.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if path.exists() {
            candle::bail!("FID stats file {} already exists", path.display())
        }
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        for (name, moments) in [("real", &self.real), ("fake", &self.fake)] {
            tensors.insert(
                format!("{name}.count"),
                Tensor::from_vec(vec![moments.count as f64], 1, &device)?,
            );
            tensors.insert(
                format!("{name}.sum"),
                Tensor::from_vec(moments.sum.clone(), self.dim, &device)?,
            );
            tensors.insert(
                format!("{name}.outer"),
                Tensor::from_vec(moments.outer.clone(), (self.dim, self.dim), &device)?,
            );
        }
        candle::safetensors::save(&tensors, path)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let tensors = candle::safetensors::load(path.as_ref(), &Device::Cpu)?;
        let get = |name: &str| -> Result<Tensor> {
            match tensors.get(name) {
                Some(t) => Ok(t.clone()),
                None => candle::bail!("FID stats file is missing {name}"),
            }
        };
        let dim = get("real.sum")?.dim(0)?;
        let mut stats = Self::new(dim);
        for (name, split) in [("real", &mut stats.real), ("fake", &mut stats.fake)] {
            split.count = get(&format!("{name}.count"))?.to_vec1::<f64>()?[0] as usize;
            split.sum = get(&format!("{name}.sum"))?.to_vec1::<f64>()?;
            split.outer = get(&format!("{name}.outer"))?
                .flatten_all()?
                .to_vec1::<f64>()?;
        }
        Ok(stats)
    }
}
