//! TarFlow: a transformer autoregressive normalizing flow over images.
//!
//! The model maps an image to a latent with a tractable exact likelihood by
//! stacking invertible "meta blocks": each block predicts a per-patch affine
//! transform from all strictly preceding patches with a causally masked
//! transformer, so the forward (training) pass is fully parallel while the
//! reverse (sampling) pass reconstructs patches one at a time using KV caches.
//! Each meta block is followed by a learned near-orthogonal mixing of patch
//! positions which is inverted explicitly when sampling.
//!
//! Based on "Normalizing Flows are Capable Generative Models",
//! <https://arxiv.org/abs/2412.06329>.

pub mod attention;
pub mod checkpoint;
pub mod data;
pub mod distributed;
pub mod fid;
pub mod flow;
pub mod linalg;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod utils;

pub use attention::{AttnKernel, CacheSlot, SampleSession};
pub use flow::{Guide, MetaBlock, Permutation, Unitary};
pub use model::{Config, Model};
