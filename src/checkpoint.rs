//! Checkpoint I/O: the trainable weights plus the learned prior variance
//! buffer in a single safetensors file.

use std::collections::HashMap;
use std::path::Path;

use candle::Result;
use candle_nn::VarMap;

use crate::model::Model;

pub const PRIOR_VAR_KEY: &str = "prior.var";

pub fn save<P: AsRef<Path>>(varmap: &VarMap, model: &Model, path: P) -> Result<()> {
    let mut tensors = varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect::<HashMap<_, _>>();
    tensors.insert(PRIOR_VAR_KEY.to_string(), model.prior_var().as_tensor().clone());
    candle::safetensors::save(&tensors, path)
}

/// Load weights into an existing varmap and restore the prior variance.
/// The varmap must already hold variables of matching names and shapes,
/// i.e. the model must be constructed before loading.
pub fn load<P: AsRef<Path>>(varmap: &mut VarMap, model: &Model, path: P) -> Result<()> {
    varmap.load(path.as_ref())?;
    let tensors = candle::safetensors::load(path.as_ref(), model.prior_var().device())?;
    match tensors.get(PRIOR_VAR_KEY) {
        Some(var) => model.prior_var().set(var)?,
        None => candle::bail!("checkpoint is missing {PRIOR_VAR_KEY}"),
    }
    Ok(())
}
