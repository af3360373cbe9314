//! The invertible flow layers: patch-sequence permutations, the
//! autoregressive coupling block (`MetaBlock`) and the learned
//! position-mixing layer (`Unitary`).

use candle::{DType, Device, Result, Tensor, D};
use candle_nn::{linear, Init, Linear, Module, VarBuilder};

use crate::attention::{AttentionBlock, CacheSlot, SampleSession};
use crate::linalg;
use crate::model::Config;

/// Reordering of a patch sequence applied before and after a coupling block.
/// Both supported variants are self-inverse; `Flip` goes through an index
/// permutation so that future variants only need to supply indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permutation {
    Identity,
    Flip,
}

impl Permutation {
    pub fn apply(&self, x: &Tensor, dim: usize, inverse: bool) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Flip => {
                // Self-inverse, so the forward and inverse index maps agree.
                let _ = inverse;
                let n = x.dim(dim)?;
                let idx = (0..n as u32).rev().collect::<Vec<_>>();
                let idx = Tensor::from_vec(idx, n, x.device())?;
                // index_select requires a contiguous input; the reverse pass
                // hands over cat outputs which are not.
                x.contiguous()?.index_select(&idx, dim)
            }
        }
    }
}

/// Which of the predicted affine parameters classifier-free guidance
/// extrapolates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Guide {
    Scale,
    Shift,
    #[default]
    Both,
}

impl Guide {
    fn scale(&self) -> bool {
        matches!(self, Self::Scale | Self::Both)
    }

    fn shift(&self) -> bool {
        matches!(self, Self::Shift | Self::Both)
    }
}

impl std::fmt::Display for Guide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scale => "a",
            Self::Shift => "b",
            Self::Both => "ab",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Guide {
    type Err = candle::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "a" => Ok(Self::Scale),
            "b" => Ok(Self::Shift),
            "ab" | "ba" => Ok(Self::Both),
            _ => candle::bail!("invalid guide spec {s}, expected a, b or ab"),
        }
    }
}

/// One flow layer: a causally masked transformer predicts a per-patch affine
/// transform `(a, b)` from all strictly preceding patches.
///
/// The forward direction `y = (x - b) * exp(-a)` is fully parallel thanks to
/// the causal mask; the reverse direction `x = y * exp(a) + b` has to walk
/// the sequence one patch at a time, reusing cached attention state.
#[derive(Debug, Clone)]
pub struct MetaBlock {
    proj_in: Linear,
    pos_embed: Tensor,
    class_embed: Option<Tensor>,
    blocks: Vec<AttentionBlock>,
    proj_out: Linear,
    permutation: Permutation,
    attn_mask: Tensor,
    nvp: bool,
}

impl MetaBlock {
    pub fn new(cfg: &Config, permutation: Permutation, vb: VarBuilder) -> Result<Self> {
        let num_patches = cfg.num_patches();
        let pixel_channels = cfg.pixel_channels();
        let channels = cfg.channels;
        let proj_in = linear(pixel_channels, channels, vb.pp("proj_in"))?;
        let pos_embed = vb.get_with_hints(
            (num_patches, channels),
            "pos_embed",
            Init::Randn {
                mean: 0.,
                stdev: 1e-2,
            },
        )?;
        let class_embed = if cfg.num_classes > 0 {
            Some(vb.get_with_hints(
                (cfg.num_classes, channels),
                "class_embed",
                Init::Randn {
                    mean: 0.,
                    stdev: 1e-2,
                },
            )?)
        } else {
            None
        };
        let blocks = (0..cfg.layers_per_block)
            .map(|i| {
                AttentionBlock::new(
                    channels,
                    cfg.head_dim,
                    cfg.expansion,
                    cfg.attn_kernel,
                    vb.pp(format!("attn_blocks.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        // The output projection starts at zero so every block is initialized
        // to the identity transform; the bias keeps the default init.
        let output_dim = if cfg.nvp {
            pixel_channels * 2
        } else {
            pixel_channels
        };
        let proj_out_vb = vb.pp("proj_out");
        let ws = proj_out_vb.get_with_hints((output_dim, channels), "weight", Init::Const(0.))?;
        let bound = 1. / (channels as f64).sqrt();
        let bs = proj_out_vb.get_with_hints(
            output_dim,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        let proj_out = Linear::new(ws, Some(bs));
        let attn_mask = Tensor::tril2(num_patches, DType::U8, vb.device())?;
        Ok(Self {
            proj_in,
            pos_embed,
            class_embed,
            blocks,
            proj_out,
            permutation,
            attn_mask,
            nvp: cfg.nvp,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    pub fn permutation(&self) -> Permutation {
        self.permutation
    }

    /// Class-conditioning term of shape `(batch | 1, 1, channels)`.
    ///
    /// Labels are exact class embeddings when non-negative; a negative label
    /// marks a sample as "unknown" and selects the class-mean embedding
    /// instead (classifier-free-guidance style training). Without labels the
    /// class-mean embedding is used.
    fn class_cond(&self, y: Option<&Tensor>) -> Result<Option<Tensor>> {
        let embed = match &self.class_embed {
            None => return Ok(None),
            Some(embed) => embed,
        };
        let channels = embed.dim(1)?;
        let mean = embed.mean(0)?.reshape((1, 1, channels))?;
        let cond = match y {
            None => mean,
            Some(y) => {
                let num_classes = embed.dim(0)? as i64;
                let ids = y.clamp(0i64, num_classes - 1)?;
                let by_class = embed.index_select(&ids, 0)?.unsqueeze(1)?;
                let unknown = y
                    .lt(0i64)?
                    .to_dtype(embed.dtype())?
                    .reshape((y.dim(0)?, 1, 1))?;
                let keep = (1.0 - &unknown)?;
                (by_class.broadcast_mul(&keep)? + mean.broadcast_mul(&unknown)?)?
            }
        };
        Ok(Some(cond))
    }

    /// Split the projected output into the affine parameters. For the
    /// volume-preserving variant the scale is pinned to zero.
    fn split_affine(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        if self.nvp {
            let parts = x.chunk(2, D::Minus1)?;
            Ok((parts[0].clone(), parts[1].clone()))
        } else {
            Ok((x.zeros_like()?, x.clone()))
        }
    }

    /// Forward coupling transform. Returns the transformed sequence and this
    /// block's per-sample log-determinant contribution `-mean(a)`.
    pub fn forward(&self, x: &Tensor, y: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let x_in = self.permutation.apply(x, 1, false)?;
        let pos_embed = self.permutation.apply(&self.pos_embed, 0, false)?;
        let mut h = self.proj_in.forward(&x_in)?.broadcast_add(&pos_embed)?;
        if let Some(cond) = self.class_cond(y)? {
            h = h.broadcast_add(&cond)?;
        }
        for block in self.blocks.iter() {
            h = block.forward(&h, Some(&self.attn_mask), 1.0)?;
        }
        let out = self.proj_out.forward(&h)?;
        // Shift predictions down one position: position 0 has no predecessors
        // so its transform must be the identity.
        let t = out.dim(1)?;
        let zeros = out.narrow(1, 0, 1)?.zeros_like()?;
        let out = Tensor::cat(&[&zeros, &out.narrow(1, 0, t - 1)?], 1)?;
        let (xa, xb) = self.split_affine(&out)?;
        let scale = xa
            .to_dtype(DType::F32)?
            .neg()?
            .exp()?
            .to_dtype(xa.dtype())?;
        let out = ((x_in - xb)? * scale)?;
        let out = self.permutation.apply(&out, 1, true)?;
        let logdet = xa.mean(D::Minus1)?.mean(D::Minus1)?.neg()?;
        Ok((out, logdet))
    }

    /// One reverse step: embed reconstructed patch `i` alone and predict the
    /// affine parameters for position `i + 1` from the cached history.
    fn reverse_step(
        &self,
        x_i: &Tensor,
        pos_embed: &Tensor,
        i: usize,
        y: Option<&Tensor>,
        attn_temp: f64,
        session: &mut SampleSession,
        slot: CacheSlot,
    ) -> Result<(Tensor, Tensor)> {
        let mut h = self
            .proj_in
            .forward(x_i)?
            .broadcast_add(&pos_embed.narrow(0, i, 1)?)?;
        if let Some(cond) = self.class_cond(y)? {
            h = h.broadcast_add(&cond)?;
        }
        for (idx, block) in self.blocks.iter().enumerate() {
            h = block.decode_step(&h, session.layer_mut(idx), slot, attn_temp)?;
        }
        let out = self.proj_out.forward(&h)?;
        self.split_affine(&out)
    }

    /// Autoregressive inverse of [`Self::forward`]. Strictly sequential: each
    /// position's reconstruction feeds the caches consumed by the next one.
    /// The session is cleared on entry; after the pass each layer's `cond`
    /// slot holds `T - 1` entries.
    #[allow(clippy::too_many_arguments)]
    pub fn reverse(
        &self,
        x: &Tensor,
        y: Option<&Tensor>,
        guidance: f64,
        guide: Guide,
        attn_temp: f64,
        annealed_guidance: bool,
        session: &mut SampleSession,
    ) -> Result<Tensor> {
        if session.num_layers() != self.blocks.len() {
            candle::bail!(
                "sample session has {} layers, block has {}",
                session.num_layers(),
                self.blocks.len()
            )
        }
        session.clear();
        let x = self.permutation.apply(x, 1, false)?;
        let pos_embed = self.permutation.apply(&self.pos_embed, 0, false)?;
        let t = x.dim(1)?;
        let mut xs = (0..t)
            .map(|i| x.narrow(1, i, 1))
            .collect::<Result<Vec<_>>>()?;
        for i in 0..t - 1 {
            let (mut za, mut zb) =
                self.reverse_step(&xs[i], &pos_embed, i, y, 1.0, session, CacheSlot::Cond)?;
            if guidance > 0. {
                let (za_u, zb_u) = self.reverse_step(
                    &xs[i],
                    &pos_embed,
                    i,
                    None,
                    attn_temp,
                    session,
                    CacheSlot::Uncond,
                )?;
                let g = if annealed_guidance {
                    (i + 1) as f64 / (t - 1) as f64 * guidance
                } else {
                    guidance
                };
                if guide.scale() {
                    za = (&za + ((&za - &za_u)? * g)?)?;
                }
                if guide.shift() {
                    zb = (&zb + ((&zb - &zb_u)? * g)?)?;
                }
            }
            let scale = za
                .to_dtype(DType::F32)?
                .exp()?
                .to_dtype(za.dtype())?;
            xs[i + 1] = ((&xs[i + 1] * scale)? + zb)?;
        }
        let x = Tensor::cat(&xs.iter().collect::<Vec<_>>(), 1)?;
        self.permutation.apply(&x, 1, true)
    }
}

/// A learned near-orthogonal mixing of the patch-position axis. The matrix
/// is parameterized as `identity + weight` so it starts near the identity;
/// the reverse direction goes through the explicit matrix inverse.
#[derive(Debug, Clone)]
pub struct Unitary {
    weight: Tensor,
    num_patches: usize,
}

impl Unitary {
    pub fn new(num_patches: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (num_patches, num_patches),
            "weight",
            Init::Randn {
                mean: 0.,
                stdev: 1e-2,
            },
        )?;
        Ok(Self {
            weight,
            num_patches,
        })
    }

    pub fn matrix(&self) -> Result<Tensor> {
        let eye = linalg::eye(self.num_patches, self.weight.dtype(), self.weight.device())?;
        &eye + &self.weight
    }

    fn mix(x: &Tensor, m: &Tensor) -> Result<Tensor> {
        // out[b, m, c] = sum_n x[b, n, c] * M[n, m], i.e. a matmul along the
        // position axis with the channel axis untouched.
        x.transpose(1, 2)?
            .contiguous()?
            .broadcast_matmul(m)?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Self::mix(x, &self.matrix()?)
    }

    /// Inverse mixing. A singular matrix is a fatal numerical error.
    pub fn reverse(&self, x: &Tensor) -> Result<Tensor> {
        Self::mix(x, &linalg::inverse(&self.matrix()?)?)
    }

    /// Per-patch normalized log-determinant contribution as a scalar tensor,
    /// differentiable in the mixing weight.
    pub fn logdet(&self) -> Result<Tensor> {
        let m = self.matrix()?;
        let device = m.device().clone();
        let logdet = m.to_device(&Device::Cpu)?.apply_op1(linalg::LogAbsDet)?;
        logdet
            .to_device(&device)?
            .affine(1. / self.num_patches as f64, 0.)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;
    use candle_nn::VarMap;

    #[test]
    fn flip_round_trips() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, 24., &device)?.reshape((2, 4, 3))?;
        let flipped = Permutation::Flip.apply(&x, 1, false)?;
        let back = Permutation::Flip.apply(&flipped, 1, true)?;
        assert_eq!(x.to_vec3::<f32>()?, back.to_vec3::<f32>()?);
        let same = Permutation::Identity.apply(&x, 1, false)?;
        assert_eq!(x.to_vec3::<f32>()?, same.to_vec3::<f32>()?);
        Ok(())
    }

    #[test]
    fn unitary_round_trips() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let unitary = Unitary::new(6, vb)?;
        let x = Tensor::randn(0f32, 1., (2, 6, 5), &device)?;
        let back = unitary.reverse(&unitary.forward(&x)?)?;
        let diff = (&x - &back)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-4, "round trip error {diff}");
        Ok(())
    }

    #[test]
    fn unitary_logdet_near_zero_at_init() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        // Matrix is identity + small noise, so log|det| should be tiny.
        let unitary = Unitary::new(8, vb)?;
        assert!(unitary.logdet()?.to_scalar::<f32>()?.abs() < 0.5);
        Ok(())
    }

    #[test]
    fn unitary_logdet_carries_gradient() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let unitary = Unitary::new(4, vb.pp("unitary"))?;
        let logdet = unitary.logdet()?;
        let grads = logdet.backward()?;
        let weight = &varmap.all_vars()[0];
        let grad = match grads.get(weight.as_tensor()) {
            Some(grad) => grad.clone(),
            None => panic!("no gradient reached the mixing weight"),
        };
        // d(log|det M| / T) / dW = (M^-1)^T / T.
        let expected = linalg::inverse(&unitary.matrix()?)?.t()?.affine(0.25, 0.)?;
        let diff = (&grad - &expected)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5, "gradient mismatch {diff}");
        Ok(())
    }

    #[test]
    fn flip_applies_to_cat_outputs() -> Result<()> {
        // Tensor::cat along dim 1 yields a non-contiguous layout, exactly
        // what the sequential reverse pass hands to the final inverse
        // permutation.
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, 24., &device)?.reshape((2, 4, 3))?;
        let parts = (0..4)
            .map(|i| x.narrow(1, i, 1))
            .collect::<Result<Vec<_>>>()?;
        let cat = Tensor::cat(&parts.iter().collect::<Vec<_>>(), 1)?;
        let flipped = Permutation::Flip.apply(&cat, 1, true)?;
        let expected = Permutation::Flip.apply(&x, 1, true)?;
        assert_eq!(flipped.to_vec3::<f32>()?, expected.to_vec3::<f32>()?);
        Ok(())
    }

    #[test]
    fn guide_spec_parses() {
        assert_eq!("a".parse::<Guide>().unwrap(), Guide::Scale);
        assert_eq!("b".parse::<Guide>().unwrap(), Guide::Shift);
        assert_eq!("ab".parse::<Guide>().unwrap(), Guide::Both);
        assert!("xyz".parse::<Guide>().is_err());
    }
}
