//! End-to-end properties of the flow: invertibility, causality, likelihood
//! bookkeeping and KV-cache behavior during sampling.

use candle::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use candle_tarflow::attention::SampleSession;
use candle_tarflow::flow::{Guide, MetaBlock, Permutation};
use candle_tarflow::model::{Config, Model};

fn small_config(nvp: bool, num_classes: usize) -> Config {
    Config {
        in_channels: 2,
        img_size: 4,
        patch_size: 2,
        channels: 16,
        num_blocks: 2,
        layers_per_block: 2,
        head_dim: 4,
        expansion: 2,
        nvp,
        num_classes,
        ..Default::default()
    }
}

/// The properties below hold for any weights, so replace the structured
/// initialization (zero output projections included) with small noise.
fn randomize(varmap: &VarMap, device: &Device) -> Result<()> {
    for var in varmap.all_vars() {
        var.set(&Tensor::randn(0f32, 0.05, var.shape(), device)?)?;
    }
    Ok(())
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

fn build_block(nvp: bool, permutation: Permutation) -> Result<(MetaBlock, Device)> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let block = MetaBlock::new(&small_config(nvp, 0), permutation, vb.pp("block"))?;
    randomize(&varmap, &device)?;
    Ok((block, device))
}

#[test]
fn meta_block_reverse_inverts_forward() -> Result<()> {
    for nvp in [true, false] {
        for permutation in [Permutation::Identity, Permutation::Flip] {
            let (block, device) = build_block(nvp, permutation)?;
            let x = Tensor::randn(0f32, 1., (2, 4, 8), &device)?;
            let (z, _logdet) = block.forward(&x, None)?;
            let mut session = SampleSession::new(block.num_layers());
            let back = block.reverse(&z, None, 0., Guide::Both, 1., false, &mut session)?;
            let diff = max_abs_diff(&x, &back)?;
            assert!(
                diff < 1e-4,
                "round trip failed (nvp {nvp}, {permutation:?}): {diff}"
            );
        }
    }
    Ok(())
}

#[test]
fn outputs_only_depend_on_preceding_positions() -> Result<()> {
    let (block, device) = build_block(true, Permutation::Identity)?;
    let x = Tensor::randn(0f32, 1., (1, 4, 8), &device)?;
    let (z, _) = block.forward(&x, None)?;
    for i in 0..3 {
        // Perturb every position after i; outputs up to i must be untouched.
        let bump = Tensor::randn(0f32, 1., (1, 3 - i, 8), &device)?;
        let tail = (x.narrow(1, i + 1, 3 - i)? + bump)?;
        let x2 = Tensor::cat(&[x.narrow(1, 0, i + 1)?, tail], 1)?;
        let (z2, _) = block.forward(&x2, None)?;
        let diff = max_abs_diff(&z.narrow(1, 0, i + 1)?, &z2.narrow(1, 0, i + 1)?)?;
        assert!(diff < 1e-6, "position {i} leaked future inputs: {diff}");
    }
    Ok(())
}

#[test]
fn first_position_passes_through_unchanged() -> Result<()> {
    // Position 0 (in permuted order) has no predecessors, so its affine
    // transform is pinned to the identity.
    for (permutation, pos) in [(Permutation::Identity, 0), (Permutation::Flip, 3)] {
        let (block, device) = build_block(true, permutation)?;
        let x = Tensor::randn(0f32, 1., (2, 4, 8), &device)?;
        let (z, _) = block.forward(&x, None)?;
        let diff = max_abs_diff(&x.narrow(1, pos, 1)?, &z.narrow(1, pos, 1)?)?;
        assert!(diff < 1e-6, "{permutation:?}: {diff}");
    }
    Ok(())
}

#[test]
fn model_logdet_accumulates_per_pair_contributions() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Model::new(&small_config(true, 0), vb)?;
    randomize(&varmap, &device)?;

    let x = Tensor::randn(0f32, 1., (3, 2, 4, 4), &device)?;
    let (z, outputs, logdets) = model.forward(&x, None)?;
    assert_eq!(outputs.len(), 2);

    // Walk the stack by hand and accumulate the same quantities.
    let mut manual = model.patchify(&x)?;
    let mut acc = Tensor::zeros(3, DType::F32, &device)?;
    for (block, unitary) in model.blocks().iter().zip(model.unitaries().iter()) {
        let (zi, logdet) = block.forward(&manual, None)?;
        manual = unitary.forward(&zi)?;
        acc = (acc + logdet)?.broadcast_add(&unitary.logdet()?)?;
    }
    assert!(max_abs_diff(&z, &manual)? < 1e-5);
    assert!(max_abs_diff(&logdets, &acc)? < 1e-5);
    assert!(max_abs_diff(&outputs[1], &manual)? < 1e-5);
    Ok(())
}

#[test]
fn sampling_fills_caches_as_expected() -> Result<()> {
    use candle_tarflow::attention::CacheSlot;

    let (block, device) = build_block(true, Permutation::Identity)?;
    let z = Tensor::randn(0f32, 1., (1, 4, 8), &device)?;

    let mut session = SampleSession::new(block.num_layers());
    block.reverse(&z, None, 0., Guide::Both, 1., false, &mut session)?;
    for idx in 0..session.num_layers() {
        // T - 1 conditional decode steps, no unconditional branch.
        assert_eq!(session.layer(idx).slot(CacheSlot::Cond).len(), 3);
        assert!(session.layer(idx).slot(CacheSlot::Uncond).is_empty());
    }

    block.reverse(&z, None, 1.5, Guide::Both, 0.8, true, &mut session)?;
    for idx in 0..session.num_layers() {
        assert_eq!(session.layer(idx).slot(CacheSlot::Cond).len(), 3);
        assert_eq!(session.layer(idx).slot(CacheSlot::Uncond).len(), 3);
    }

    session.clear();
    for idx in 0..session.num_layers() {
        assert!(session.layer(idx).slot(CacheSlot::Cond).is_empty());
        assert!(session.layer(idx).slot(CacheSlot::Uncond).is_empty());
    }
    Ok(())
}

#[test]
fn model_reverse_reconstructs_forward_latent() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = Model::new(&small_config(true, 0), vb)?;
    randomize(&varmap, &device)?;

    let x = Tensor::randn(0f32, 1., (2, 2, 4, 4), &device)?;
    let (z, _outputs, _logdets) = model.forward(&x, None)?;
    // The prior variance is still all ones, so the latent feeds straight back
    // through the reverse path.
    let back = model.reverse(&z, None, 0., Guide::Both, 1., false)?;
    let diff = max_abs_diff(&x, &back)?;
    assert!(diff < 1e-4, "round trip error {diff}");
    Ok(())
}

#[test]
fn unknown_labels_match_unlabeled_conditioning() -> Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let block = MetaBlock::new(&small_config(true, 3), Permutation::Identity, vb.pp("block"))?;
    randomize(&varmap, &device)?;

    let x = Tensor::randn(0f32, 1., (2, 4, 8), &device)?;
    let unknown = Tensor::full(-1i64, 2, &device)?;
    let (z_unknown, _) = block.forward(&x, Some(&unknown))?;
    let (z_none, _) = block.forward(&x, None)?;
    assert!(max_abs_diff(&z_unknown, &z_none)? < 1e-6);

    // A real label must actually change the output.
    let labeled = Tensor::full(1i64, 2, &device)?;
    let (z_labeled, _) = block.forward(&x, Some(&labeled))?;
    assert!(max_abs_diff(&z_labeled, &z_none)? > 1e-6);
    Ok(())
}
