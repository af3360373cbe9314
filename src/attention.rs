//! Masked self-attention with an append-only KV cache for autoregressive
//! decoding, plus the position-wise MLP and the residual transformer block.

use candle::{DType, Result, Tensor, D};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, Module, VarBuilder};
use serde::Deserialize;

/// Which attention compute path to use. Both apply the same
/// `head_dim^-0.5 / temp` scale and agree up to float tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttnKernel {
    /// Batch and head dims merged into a single batched matmul.
    #[default]
    Fused,
    /// Per-head matmuls, kept as the reference implementation.
    Reference,
}

/// The two independent decode streams of a sampling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSlot {
    Cond,
    Uncond,
}

/// Per-step key/value tensors appended during autoregressive decoding.
/// Entries are `(batch, heads, 1, head_dim)`; the concatenated history is
/// materialized on demand.
#[derive(Debug, Clone, Default)]
pub struct KvCacheSlot {
    k: Vec<Tensor>,
    v: Vec<Tensor>,
}

impl KvCacheSlot {
    pub fn len(&self) -> usize {
        self.k.len()
    }

    pub fn is_empty(&self) -> bool {
        self.k.is_empty()
    }

    pub fn clear(&mut self) {
        self.k.clear();
        self.v.clear();
    }

    fn append(&mut self, k: Tensor, v: Tensor) {
        self.k.push(k);
        self.v.push(v);
    }

    fn keys(&self) -> Result<Tensor> {
        Tensor::cat(&self.k.iter().collect::<Vec<_>>(), 2)
    }

    fn values(&self) -> Result<Tensor> {
        Tensor::cat(&self.v.iter().collect::<Vec<_>>(), 2)
    }
}

/// Both cache slots of one attention layer.
#[derive(Debug, Clone, Default)]
pub struct LayerKvCache {
    cond: KvCacheSlot,
    uncond: KvCacheSlot,
}

impl LayerKvCache {
    pub fn slot(&self, which: CacheSlot) -> &KvCacheSlot {
        match which {
            CacheSlot::Cond => &self.cond,
            CacheSlot::Uncond => &self.uncond,
        }
    }

    pub fn slot_mut(&mut self, which: CacheSlot) -> &mut KvCacheSlot {
        match which {
            CacheSlot::Cond => &mut self.cond,
            CacheSlot::Uncond => &mut self.uncond,
        }
    }

    pub fn clear(&mut self) {
        self.cond.clear();
        self.uncond.clear();
    }
}

/// Decode-session state for one meta block: one KV cache per attention
/// layer. Owned by the caller of the reverse pass so that independent
/// sampling sessions cannot step on each other's state.
#[derive(Debug, Clone)]
pub struct SampleSession {
    layers: Vec<LayerKvCache>,
}

impl SampleSession {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![LayerKvCache::default(); num_layers],
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, idx: usize) -> &LayerKvCache {
        &self.layers[idx]
    }

    pub(crate) fn layer_mut(&mut self, idx: usize) -> &mut LayerKvCache {
        &mut self.layers[idx]
    }

    pub fn clear(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.clear()
        }
    }
}

fn masked_softmax(scores: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    let scores = match mask {
        None => scores.clone(),
        Some(mask) => {
            // mask: 1 = keep, 0 = forbidden. Forbidden logits go to -inf so
            // they contribute exactly zero weight after the softmax.
            let on_false = Tensor::new(f32::NEG_INFINITY, scores.device())?
                .to_dtype(scores.dtype())?
                .broadcast_as(scores.shape())?;
            mask.broadcast_as(scores.shape())?
                .where_cond(scores, &on_false)?
        }
    };
    let probs = candle_nn::ops::softmax(&scores.to_dtype(DType::F32)?, D::Minus1)?;
    probs.to_dtype(scores.dtype())
}

#[derive(Debug, Clone)]
pub struct Attention {
    norm: LayerNorm,
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    kernel: AttnKernel,
}

impl Attention {
    pub fn new(
        channels: usize,
        head_dim: usize,
        kernel: AttnKernel,
        vb: VarBuilder,
    ) -> Result<Self> {
        if channels % head_dim != 0 {
            candle::bail!("channels {channels} not divisible by head width {head_dim}")
        }
        let norm = layer_norm(channels, 1e-5, vb.pp("norm"))?;
        let qkv = linear(channels, channels * 3, vb.pp("qkv"))?;
        let proj = linear(channels, channels, vb.pp("proj"))?;
        Ok(Self {
            norm,
            qkv,
            proj,
            num_heads: channels / head_dim,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            kernel,
        })
    }

    /// Project the (normalized) input to per-head query/key/value tensors of
    /// shape `(batch, heads, seq, head_dim)`.
    fn qkv(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (b, t, _c) = x.dims3()?;
        let x = self.norm.forward(x)?;
        let qkv = self
            .qkv
            .forward(&x)?
            .reshape((b, t, 3 * self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let chunks = qkv.chunk(3, 1)?;
        Ok((
            chunks[0].contiguous()?,
            chunks[1].contiguous()?,
            chunks[2].contiguous()?,
        ))
    }

    /// Scaled dot-product attention over `(batch, heads, seq, head_dim)`
    /// inputs, dispatching on the selected kernel.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        temp: f64,
    ) -> Result<Tensor> {
        let (b, h, t, d) = q.dims4()?;
        let t_k = k.dim(2)?;
        let scale = self.scale / temp;
        let out = match self.kernel {
            AttnKernel::Fused => {
                let q = q.reshape((b * h, t, d))?;
                let k = k.reshape((b * h, t_k, d))?;
                let v = v.reshape((b * h, t_k, d))?;
                let scores = (q.matmul(&k.t()?)? * scale)?;
                let probs = masked_softmax(&scores, mask)?;
                probs.matmul(&v)?.reshape((b, h, t, d))?
            }
            AttnKernel::Reference => {
                let mut per_head = Vec::with_capacity(h);
                for head in 0..h {
                    let q = q.narrow(1, head, 1)?.squeeze(1)?;
                    let k = k.narrow(1, head, 1)?.squeeze(1)?;
                    let v = v.narrow(1, head, 1)?.squeeze(1)?;
                    let scores = (q.contiguous()?.matmul(&k.contiguous()?.t()?)? * scale)?;
                    let probs = masked_softmax(&scores, mask)?;
                    per_head.push(probs.matmul(&v.contiguous()?)?);
                }
                Tensor::stack(&per_head, 1)?
            }
        };
        let out = out.transpose(1, 2)?.contiguous()?.reshape((b, t, h * d))?;
        self.proj.forward(&out)
    }

    /// Full-sequence attention under an optional boolean mask (training and
    /// likelihood evaluation path).
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>, temp: f64) -> Result<Tensor> {
        let (q, k, v) = self.qkv(x)?;
        self.attend(&q, &k, &v, mask, temp)
    }

    /// One autoregressive step: append this step's key/value to the cache and
    /// attend the new query against the whole cached history. The cache
    /// naturally excludes future positions, so no mask is needed.
    pub fn decode_step(&self, x: &Tensor, cache: &mut KvCacheSlot, temp: f64) -> Result<Tensor> {
        let (q, k, v) = self.qkv(x)?;
        cache.append(k, v);
        let k = cache.keys()?;
        let v = cache.values()?;
        self.attend(&q, &k, &v, None, temp)
    }
}

#[derive(Debug, Clone)]
pub struct Mlp {
    norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    pub fn new(channels: usize, expansion: usize, vb: VarBuilder) -> Result<Self> {
        let norm = layer_norm(channels, 1e-5, vb.pp("norm"))?;
        let fc1 = linear(channels, channels * expansion, vb.pp("fc1"))?;
        let fc2 = linear(channels * expansion, channels, vb.pp("fc2"))?;
        Ok(Self { norm, fc1, fc2 })
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.norm.forward(x)?;
        self.fc2.forward(&self.fc1.forward(&x)?.gelu_erf()?)
    }
}

/// Residual composition `x + attn(x)` then `x + mlp(x)`.
#[derive(Debug, Clone)]
pub struct AttentionBlock {
    attn: Attention,
    mlp: Mlp,
}

impl AttentionBlock {
    pub fn new(
        channels: usize,
        head_dim: usize,
        expansion: usize,
        kernel: AttnKernel,
        vb: VarBuilder,
    ) -> Result<Self> {
        let attn = Attention::new(channels, head_dim, kernel, vb.pp("attention"))?;
        let mlp = Mlp::new(channels, expansion, vb.pp("mlp"))?;
        Ok(Self { attn, mlp })
    }

    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>, temp: f64) -> Result<Tensor> {
        let x = (x + self.attn.forward(x, mask, temp)?)?;
        &x + self.mlp.forward(&x)?
    }

    pub fn decode_step(
        &self,
        x: &Tensor,
        cache: &mut LayerKvCache,
        slot: CacheSlot,
        temp: f64,
    ) -> Result<Tensor> {
        let x = (x + self.attn.decode_step(x, cache.slot_mut(slot), temp)?)?;
        &x + self.mlp.forward(&x)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
    }

    #[test]
    fn head_width_must_divide_channels() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(Attention::new(48, 7, AttnKernel::Fused, vb).is_err());
    }

    #[test]
    fn fused_and_reference_kernels_agree() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        // Same varmap prefix, so both instances share the same weights.
        let fused = Attention::new(32, 8, AttnKernel::Fused, vb.pp("attn"))?;
        let reference = Attention::new(32, 8, AttnKernel::Reference, vb.pp("attn"))?;
        for var in varmap.all_vars() {
            var.set(&Tensor::randn(0f32, 0.2, var.shape(), &device)?)?;
        }

        let x = Tensor::randn(0f32, 1., (2, 5, 32), &device)?;
        let mask = Tensor::tril2(5, DType::U8, &device)?;
        let a = fused.forward(&x, Some(&mask), 1.0)?;
        let b = reference.forward(&x, Some(&mask), 1.0)?;
        let diff = max_abs_diff(&a, &b)?;
        assert!(diff < 1e-5, "kernel mismatch: {diff}");
        Ok(())
    }

    #[test]
    fn decode_steps_match_masked_forward() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = Attention::new(16, 4, AttnKernel::Fused, vb.pp("attn"))?;
        for var in varmap.all_vars() {
            var.set(&Tensor::randn(0f32, 0.2, var.shape(), &device)?)?;
        }

        let t = 4;
        let x = Tensor::randn(0f32, 1., (1, t, 16), &device)?;
        let mask = Tensor::tril2(t, DType::U8, &device)?;
        let full = attn.forward(&x, Some(&mask), 1.0)?;

        let mut cache = KvCacheSlot::default();
        for i in 0..t {
            let step = attn.decode_step(&x.narrow(1, i, 1)?, &mut cache, 1.0)?;
            let expected = full.narrow(1, i, 1)?;
            let diff = max_abs_diff(&step, &expected)?;
            assert!(diff < 1e-5, "step {i} mismatch: {diff}");
        }
        assert_eq!(cache.len(), t);
        cache.clear();
        assert!(cache.is_empty());
        Ok(())
    }
}
