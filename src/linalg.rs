//! Small dense linear-algebra routines that candle does not provide:
//! explicit matrix inverse, sign/log-determinant and a symmetric
//! eigendecomposition. Everything runs on the host in f64; the matrices
//! involved are at most `num_patches` square so this is never a bottleneck.

use candle::{CpuStorage, CustomOp1, DType, Device, Layout, Result, Shape, Tensor};

/// Identity matrix.
pub fn eye(n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; n * n];
    for i in 0..n {
        data[i * n + i] = 1.;
    }
    Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)
}

fn to_square(t: &Tensor) -> Result<(Vec<f64>, usize)> {
    let (rows, cols) = t.dims2()?;
    if rows != cols {
        candle::bail!("expected a square matrix, got {rows}x{cols}")
    }
    let data = t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    Ok((data, rows))
}

/// LU factorization with partial pivoting (Doolittle). `lu` packs both
/// factors; `perm` records row swaps; `sign` tracks the permutation parity.
struct Lu {
    lu: Vec<f64>,
    perm: Vec<usize>,
    sign: f64,
    n: usize,
}

fn factorize(mut a: Vec<f64>, n: usize) -> Result<Lu> {
    let mut perm = (0..n).collect::<Vec<_>>();
    let mut sign = 1f64;
    for k in 0..n {
        let mut pivot = k;
        let mut best = a[k * n + k].abs();
        for i in k + 1..n {
            let v = a[i * n + k].abs();
            if v > best {
                best = v;
                pivot = i;
            }
        }
        if best < 1e-12 {
            candle::bail!("matrix is singular, cannot factorize")
        }
        if pivot != k {
            for j in 0..n {
                a.swap(k * n + j, pivot * n + j);
            }
            perm.swap(k, pivot);
            sign = -sign;
        }
        let inv_pivot = 1. / a[k * n + k];
        for i in k + 1..n {
            let factor = a[i * n + k] * inv_pivot;
            a[i * n + k] = factor;
            for j in k + 1..n {
                a[i * n + j] -= factor * a[k * n + j];
            }
        }
    }
    Ok(Lu {
        lu: a,
        perm,
        sign,
        n,
    })
}

impl Lu {
    /// Solve `A x = b` in place using the packed factors.
    fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut x = self.perm.iter().map(|&p| b[p]).collect::<Vec<_>>();
        for i in 1..n {
            for j in 0..i {
                x[i] -= self.lu[i * n + j] * x[j];
            }
        }
        for i in (0..n).rev() {
            for j in i + 1..n {
                x[i] -= self.lu[i * n + j] * x[j];
            }
            x[i] /= self.lu[i * n + i];
        }
        x
    }
}

/// `log|det M|` of a square matrix as a differentiable scalar op. The
/// forward pass runs the LU factorization on the host; the backward pass is
/// the transposed inverse.
pub struct LogAbsDet;

fn log_abs_det_host(a: Vec<f64>, n: usize) -> Result<f64> {
    let lu = factorize(a, n)?;
    Ok((0..n).map(|i| lu.lu[i * n + i].abs().ln()).sum())
}

impl CustomOp1 for LogAbsDet {
    fn name(&self) -> &'static str {
        "log-abs-det"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let dims = layout.shape().dims();
        if dims.len() != 2 || dims[0] != dims[1] {
            candle::bail!("log-abs-det expects a square matrix, got {dims:?}")
        }
        let n = dims[0];
        let (start, end) = match layout.contiguous_offsets() {
            Some(offsets) => offsets,
            None => candle::bail!("log-abs-det requires a contiguous matrix"),
        };
        let out = match storage {
            CpuStorage::F32(vs) => {
                let a = vs[start..end].iter().map(|&v| v as f64).collect::<Vec<_>>();
                CpuStorage::F32(vec![log_abs_det_host(a, n)? as f32])
            }
            CpuStorage::F64(vs) => {
                CpuStorage::F64(vec![log_abs_det_host(vs[start..end].to_vec(), n)?])
            }
            _ => candle::bail!("log-abs-det only supports f32 and f64"),
        };
        Ok((out, Shape::from(())))
    }

    /// `d log|det M| / dM = (M^-1)^T`, scaled by the incoming scalar grad.
    fn bwd(&self, arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let grad = inverse(arg)?.t()?.broadcast_mul(grad_res)?;
        Ok(Some(grad))
    }
}

/// Sign and natural log of the absolute determinant.
pub fn slogdet(t: &Tensor) -> Result<(f64, f64)> {
    let (a, n) = to_square(t)?;
    let lu = factorize(a, n)?;
    let mut sign = lu.sign;
    let mut logdet = 0f64;
    for i in 0..n {
        let d = lu.lu[i * n + i];
        if d < 0. {
            sign = -sign;
        }
        logdet += d.abs().ln();
    }
    Ok((sign, logdet))
}

/// Explicit matrix inverse. Fails on singular input.
pub fn inverse(t: &Tensor) -> Result<Tensor> {
    let (a, n) = to_square(t)?;
    let lu = factorize(a, n)?;
    let mut out = vec![0f64; n * n];
    let mut basis = vec![0f64; n];
    for col in 0..n {
        basis[col] = 1.;
        let x = lu.solve(&basis);
        basis[col] = 0.;
        for row in 0..n {
            out[row * n + col] = x[row];
        }
    }
    Tensor::from_vec(out, (n, n), t.device())?.to_dtype(t.dtype())
}

/// Jacobi eigendecomposition of a symmetric matrix. Returns the eigenvalues
/// and the eigenvectors as columns of a row-major `n x n` buffer.
pub fn sym_eig(a: &[f64], n: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    if a.len() != n * n {
        candle::bail!("sym_eig: buffer length {} != {n}x{n}", a.len())
    }
    let mut m = a.to_vec();
    let mut v = vec![0f64; n * n];
    for i in 0..n {
        v[i * n + i] = 1.;
    }
    for _sweep in 0..100 {
        let mut off = 0f64;
        for i in 0..n {
            for j in i + 1..n {
                off += m[i * n + j] * m[i * n + j];
            }
        }
        if off < 1e-24 {
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                let apq = m[p * n + q];
                if apq.abs() < 1e-300 {
                    continue;
                }
                let app = m[p * n + p];
                let aqq = m[q * n + q];
                let theta = (aqq - app) / (2. * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.).sqrt());
                let c = 1. / (t * t + 1.).sqrt();
                let s = t * c;
                for k in 0..n {
                    let mkp = m[k * n + p];
                    let mkq = m[k * n + q];
                    m[k * n + p] = c * mkp - s * mkq;
                    m[k * n + q] = s * mkp + c * mkq;
                }
                for k in 0..n {
                    let mpk = m[p * n + k];
                    let mqk = m[q * n + k];
                    m[p * n + k] = c * mpk - s * mqk;
                    m[q * n + k] = s * mpk + c * mqk;
                }
                for k in 0..n {
                    let vkp = v[k * n + p];
                    let vkq = v[k * n + q];
                    v[k * n + p] = c * vkp - s * vkq;
                    v[k * n + q] = s * vkp + c * vkq;
                }
            }
        }
    }
    let values = (0..n).map(|i| m[i * n + i]).collect();
    Ok((values, v))
}

/// Square root of a symmetric positive semi-definite matrix. Slightly
/// negative eigenvalues from float noise are clamped to zero.
pub fn sqrtm_psd(a: &[f64], n: usize) -> Result<Vec<f64>> {
    let (values, vectors) = sym_eig(a, n)?;
    let roots = values
        .iter()
        .map(|&v| v.max(0.).sqrt())
        .collect::<Vec<_>>();
    // V * sqrt(D) * V^T
    let mut out = vec![0f64; n * n];
    for i in 0..n {
        for j in 0..n {
            let mut acc = 0f64;
            for k in 0..n {
                acc += vectors[i * n + k] * roots[k] * vectors[j * n + k];
            }
            out[i * n + j] = acc;
        }
    }
    Ok(out)
}

pub fn matmul_host(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![0f64; n * n];
    for i in 0..n {
        for k in 0..n {
            let aik = a[i * n + k];
            if aik == 0. {
                continue;
            }
            for j in 0..n {
                out[i * n + j] += aik * b[k * n + j];
            }
        }
    }
    out
}
