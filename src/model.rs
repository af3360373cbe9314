//! Model orchestration: patch extraction, the stack of (MetaBlock, Unitary)
//! pairs, the exact likelihood loss and the reverse sampling path.

use candle::{Result, Tensor, Var};
use candle_nn::VarBuilder;
use serde::Deserialize;

use crate::attention::{AttnKernel, SampleSession};
use crate::flow::{Guide, MetaBlock, Permutation, Unitary};
use crate::utils::{normal_noise, warn_nan_or_inf};

/// Exponential-moving-average rate for the learned prior variance.
pub const VAR_LR: f64 = 0.1;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub in_channels: usize,
    pub img_size: usize,
    pub patch_size: usize,
    pub channels: usize,
    pub num_blocks: usize,
    pub layers_per_block: usize,
    #[serde(default = "default_head_dim")]
    pub head_dim: usize,
    #[serde(default = "default_expansion")]
    pub expansion: usize,
    #[serde(default = "default_nvp")]
    pub nvp: bool,
    #[serde(default)]
    pub num_classes: usize,
    #[serde(default)]
    pub attn_kernel: AttnKernel,
}

fn default_head_dim() -> usize {
    64
}

fn default_expansion() -> usize {
    4
}

fn default_nvp() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            in_channels: 3,
            img_size: 32,
            patch_size: 4,
            channels: 512,
            num_blocks: 4,
            layers_per_block: 4,
            head_dim: 64,
            expansion: 4,
            nvp: true,
            num_classes: 0,
            attn_kernel: AttnKernel::Fused,
        }
    }
}

impl Config {
    pub fn num_patches(&self) -> usize {
        (self.img_size / self.patch_size) * (self.img_size / self.patch_size)
    }

    pub fn pixel_channels(&self) -> usize {
        self.in_channels * self.patch_size * self.patch_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.img_size % self.patch_size != 0 {
            candle::bail!(
                "image size {} not divisible by patch size {}",
                self.img_size,
                self.patch_size
            )
        }
        if self.channels % self.head_dim != 0 {
            candle::bail!(
                "channels {} not divisible by head width {}",
                self.channels,
                self.head_dim
            )
        }
        Ok(())
    }
}

pub struct Model {
    blocks: Vec<MetaBlock>,
    unitaries: Vec<Unitary>,
    /// EMA of per-(patch, channel) output variance, learned for the
    /// non-volume-preserving prior. Starts at ones.
    var: Var,
    in_channels: usize,
    img_size: usize,
    patch_size: usize,
    num_patches: usize,
    pixel_channels: usize,
}

impl Model {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let num_patches = cfg.num_patches();
        let pixel_channels = cfg.pixel_channels();
        let mut blocks = Vec::with_capacity(cfg.num_blocks);
        let mut unitaries = Vec::with_capacity(cfg.num_blocks);
        for i in 0..cfg.num_blocks {
            let permutation = if i % 2 == 0 {
                Permutation::Identity
            } else {
                Permutation::Flip
            };
            blocks.push(MetaBlock::new(
                cfg,
                permutation,
                vb.pp(format!("blocks.{i}")),
            )?);
            unitaries.push(Unitary::new(num_patches, vb.pp(format!("unitaries.{i}")))?);
        }
        let var = Var::from_tensor(&Tensor::ones(
            (num_patches, pixel_channels),
            vb.dtype(),
            vb.device(),
        )?)?;
        Ok(Self {
            blocks,
            unitaries,
            var,
            in_channels: cfg.in_channels,
            img_size: cfg.img_size,
            patch_size: cfg.patch_size,
            num_patches,
            pixel_channels,
        })
    }

    pub fn blocks(&self) -> &[MetaBlock] {
        &self.blocks
    }

    pub fn unitaries(&self) -> &[Unitary] {
        &self.unitaries
    }

    pub fn num_patches(&self) -> usize {
        self.num_patches
    }

    pub fn pixel_channels(&self) -> usize {
        self.pixel_channels
    }

    pub fn prior_var(&self) -> &Var {
        &self.var
    }

    /// Convert an image `(N, C, H, W)` to a patch sequence `(N, T, C*p*p)`.
    /// Patches are taken row-major, each flattened channel-slowest, matching
    /// the inverse exactly.
    pub fn patchify(&self, x: &Tensor) -> Result<Tensor> {
        let (n, c, h, w) = x.dims4()?;
        let p = self.patch_size;
        if h != self.img_size || w != self.img_size {
            candle::bail!("expected {0}x{0} images, got {h}x{w}", self.img_size)
        }
        x.reshape((n, c, h / p, p, w / p, p))?
            .permute((0, 2, 4, 1, 3, 5))?
            .contiguous()?
            .reshape((n, (h / p) * (w / p), c * p * p))
    }

    /// Fold a patch sequence `(N, T, C*p*p)` back into an image.
    pub fn unpatchify(&self, x: &Tensor) -> Result<Tensor> {
        let (n, t, _) = x.dims3()?;
        let p = self.patch_size;
        let g = self.img_size / p;
        if t != self.num_patches {
            candle::bail!("expected {} patches, got {t}", self.num_patches)
        }
        x.reshape((n, g, g, self.in_channels, p, p))?
            .permute((0, 3, 1, 4, 2, 5))?
            .contiguous()?
            .reshape((n, self.in_channels, self.img_size, self.img_size))
    }

    /// Forward pass through the whole stack. Returns the final latent, every
    /// block pair's intermediate output and the accumulated per-sample
    /// log-determinant.
    pub fn forward(
        &self,
        x: &Tensor,
        y: Option<&Tensor>,
    ) -> Result<(Tensor, Vec<Tensor>, Tensor)> {
        let mut z = self.patchify(x)?;
        warn_nan_or_inf(&z, "patchify")?;
        let batch = z.dim(0)?;
        let mut logdets = Tensor::zeros(batch, z.dtype(), z.device())?;
        let mut outputs = Vec::with_capacity(self.blocks.len());
        for (i, (block, unitary)) in self.blocks.iter().zip(self.unitaries.iter()).enumerate() {
            let (zi, logdet) = block.forward(&z, y)?;
            warn_nan_or_inf(&logdet, &format!("block {i} logdet"))?;
            warn_nan_or_inf(&zi, &format!("block {i} output"))?;
            z = unitary.forward(&zi)?;
            let u_logdet = unitary.logdet()?;
            warn_nan_or_inf(&u_logdet, &format!("block {i} unitary logdet"))?;
            logdets = (logdets + logdet)?.broadcast_add(&u_logdet)?;
            outputs.push(z.clone());
        }
        Ok((z, outputs, logdets))
    }

    /// Negative log-likelihood under a standard-normal prior, exact through
    /// the change of variables.
    pub fn loss(&self, z: &Tensor, logdets: &Tensor) -> Result<Tensor> {
        let prior = (z.sqr()?.mean_all()? * 0.5)?;
        &prior - logdets.mean_all()?
    }

    /// EMA update of the learned prior variance from a batch of latents.
    pub fn update_prior(&self, z: &Tensor) -> Result<()> {
        let z2 = z.detach().sqr()?.mean(0)?;
        let new_var = ((self.var.as_tensor() * (1. - VAR_LR))? + (z2 * VAR_LR)?)?;
        self.var.set(&new_var)
    }

    /// Draw standard-normal latent noise `(batch, T, pixel_channels)` with a
    /// fixed seed.
    pub fn sample_noise(&self, batch: usize, seed: u64) -> Result<Tensor> {
        normal_noise(
            (batch, self.num_patches, self.pixel_channels),
            seed,
            self.var.device(),
        )
    }

    /// Run the flow backwards from latent noise to an image. The noise is
    /// first scaled by the learned prior's standard deviation; blocks are
    /// then undone in reverse registration order, each pair's Unitary inverse
    /// before its MetaBlock inverse.
    #[allow(clippy::too_many_arguments)]
    pub fn reverse(
        &self,
        noise: &Tensor,
        y: Option<&Tensor>,
        guidance: f64,
        guide: Guide,
        attn_temp: f64,
        annealed_guidance: bool,
    ) -> Result<Tensor> {
        let seq = self.reverse_sequence(noise, y, guidance, guide, attn_temp, annealed_guidance)?;
        match seq.into_iter().next_back() {
            Some(x) => Ok(x),
            None => candle::bail!("reverse pass produced no output"),
        }
    }

    /// Like [`Self::reverse`] but returns every intermediate reconstruction
    /// (starting from the raw noise) as unpatchified images, for
    /// visualization.
    #[allow(clippy::too_many_arguments)]
    pub fn reverse_sequence(
        &self,
        noise: &Tensor,
        y: Option<&Tensor>,
        guidance: f64,
        guide: Guide,
        attn_temp: f64,
        annealed_guidance: bool,
    ) -> Result<Vec<Tensor>> {
        let mut seq = vec![self.unpatchify(noise)?];
        let mut x = noise.broadcast_mul(&self.var.as_tensor().sqrt()?)?;
        for i in (0..self.blocks.len()).rev() {
            x = self.unitaries[i].reverse(&x)?;
            warn_nan_or_inf(&x, &format!("reverse, block {i} unitary output"))?;
            let mut session = SampleSession::new(self.blocks[i].num_layers());
            x = self.blocks[i].reverse(
                &x,
                y,
                guidance,
                guide,
                attn_temp,
                annealed_guidance,
                &mut session,
            )?;
            warn_nan_or_inf(&x, &format!("reverse, block {i} output"))?;
            seq.push(self.unpatchify(&x)?);
        }
        Ok(seq)
    }
}
