//! Numerical-validity checks, seeded noise and image-grid output.

use std::path::Path;

use candle::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Warn (and continue) if a tensor contains NaN or Inf, naming the junction
/// so divergence can be located without killing the run. A NaN anywhere
/// poisons the sum; an Inf without NaN keeps the sum infinite.
pub fn warn_nan_or_inf(t: &Tensor, what: &str) -> Result<()> {
    let sum = t.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    if sum.is_nan() {
        tracing::warn!("NaN detected in {what}");
    } else if sum.is_infinite() {
        tracing::warn!("Inf detected in {what}");
    }
    Ok(())
}

/// Standard-normal noise with an explicit seed, independent of the device
/// RNG so sampling runs are reproducible.
pub fn normal_noise(shape: (usize, usize, usize), seed: u64, device: &Device) -> Result<Tensor> {
    let (a, b, c) = shape;
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..a * b * c)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect::<Vec<_>>();
    Tensor::from_vec(data, (a, b, c), device)
}

/// Write a batch of `[-1, 1]` images `(N, C, H, W)` as one PNG grid with
/// `nrow` images per row. Supports 1- and 3-channel images.
pub fn write_image_grid<P: AsRef<Path>>(images: &Tensor, path: P, nrow: usize) -> Result<()> {
    let (n, c, h, w) = images.dims4()?;
    if c != 1 && c != 3 {
        candle::bail!("can only save 1- or 3-channel images, got {c}")
    }
    if nrow == 0 {
        candle::bail!("nrow must be positive")
    }
    let rows = n.div_ceil(nrow);
    let pixels = images
        .clamp(-1f32, 1f32)?
        .affine(127.5, 127.5)?
        .to_dtype(DType::U8)?
        .to_device(&Device::Cpu)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let mut grid = vec![0u8; rows * h * nrow * w * 3];
    for idx in 0..n {
        let (gy, gx) = (idx / nrow, idx % nrow);
        for y in 0..h {
            for x in 0..w {
                for ch in 0..3 {
                    let src_ch = if c == 1 { 0 } else { ch };
                    let value = pixels[((idx * c + src_ch) * h + y) * w + x];
                    let gx_px = gx * w + x;
                    let gy_px = gy * h + y;
                    grid[(gy_px * nrow * w + gx_px) * 3 + ch] = value;
                }
            }
        }
    }
    let img = image::RgbImage::from_raw((nrow * w) as u32, (rows * h) as u32, grid)
        .ok_or_else(|| candle::Error::Msg("image buffer size mismatch".to_string()))?;
    img.save(path.as_ref())
        .map_err(|err| candle::Error::Msg(format!("failed to save image: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_is_seed_deterministic() -> Result<()> {
        let a = normal_noise((2, 3, 4), 7, &Device::Cpu)?;
        let b = normal_noise((2, 3, 4), 7, &Device::Cpu)?;
        assert_eq!(
            a.flatten_all()?.to_vec1::<f32>()?,
            b.flatten_all()?.to_vec1::<f32>()?
        );
        let c = normal_noise((2, 3, 4), 8, &Device::Cpu)?;
        assert_ne!(
            a.flatten_all()?.to_vec1::<f32>()?,
            c.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn finite_tensor_passes_check() -> Result<()> {
        let t = Tensor::ones((2, 2), DType::F32, &Device::Cpu)?;
        warn_nan_or_inf(&t, "test")?;
        Ok(())
    }

    #[test]
    fn grid_rejects_odd_channel_counts() -> Result<()> {
        let t = Tensor::zeros((1, 2, 4, 4), DType::F32, &Device::Cpu)?;
        assert!(write_image_grid(&t, "/tmp/never-written.png", 1).is_err());
        Ok(())
    }
}
