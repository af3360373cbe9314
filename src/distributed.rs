//! Thin interface over a data-parallel collective layer. The actual
//! communication backend is an external collaborator; the model code only
//! ever calls `barrier` and `gather_concat`.

use candle::{Result, Tensor};

/// Blocking collective primitives provided by the environment. Calls return
/// once the result is available on every participating process.
pub trait Collective: Send + Sync {
    /// Block until every process has reached this point.
    fn barrier(&self) -> Result<()>;

    /// Every process contributes `x`; each receives all contributions.
    fn all_gather(&self, x: &Tensor) -> Result<Vec<Tensor>>;
}

/// Handle on the process group, with an explicit lifecycle: construct via
/// [`Distributed::single`] or [`Distributed::init`], tear down via
/// [`Distributed::shutdown`].
pub struct Distributed {
    backend: Option<Box<dyn Collective>>,
    rank: usize,
    local_rank: usize,
    world_size: usize,
}

impl Distributed {
    /// Single-process group; every collective is a no-op.
    pub fn single() -> Self {
        Self {
            backend: None,
            rank: 0,
            local_rank: 0,
            world_size: 1,
        }
    }

    pub fn init(
        backend: Box<dyn Collective>,
        rank: usize,
        local_rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            candle::bail!("invalid process group: rank {rank} of {world_size}")
        }
        let dist = Self {
            backend: Some(backend),
            rank,
            local_rank,
            world_size,
        };
        dist.barrier()?;
        Ok(dist)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    pub fn barrier(&self) -> Result<()> {
        match &self.backend {
            None => Ok(()),
            Some(backend) => backend.barrier(),
        }
    }

    /// Concatenation of every process's tensor along the first axis. With a
    /// single process this is the identity.
    pub fn gather_concat(&self, x: &Tensor) -> Result<Tensor> {
        match &self.backend {
            None => Ok(x.clone()),
            Some(backend) => {
                let parts = backend.all_gather(x)?;
                Tensor::cat(&parts.iter().collect::<Vec<_>>(), 0)
            }
        }
    }

    /// Release the process group. Must be called by the owning orchestration
    /// layer once all collectives are done.
    pub fn shutdown(self) -> Result<()> {
        if let Some(backend) = &self.backend {
            backend.barrier()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    /// Pretends every process contributed the same tensor.
    struct Loopback {
        world_size: usize,
    }

    impl Collective for Loopback {
        fn barrier(&self) -> Result<()> {
            Ok(())
        }

        fn all_gather(&self, x: &Tensor) -> Result<Vec<Tensor>> {
            Ok(vec![x.clone(); self.world_size])
        }
    }

    #[test]
    fn single_process_is_identity() -> Result<()> {
        let dist = Distributed::single();
        let x = Tensor::arange(0f32, 6., &Device::Cpu)?.reshape((2, 3))?;
        let gathered = dist.gather_concat(&x)?;
        assert_eq!(gathered.dims(), [2, 3]);
        dist.barrier()?;
        dist.shutdown()?;
        Ok(())
    }

    #[test]
    fn gather_concat_stacks_contributions() -> Result<()> {
        let dist = Distributed::init(Box::new(Loopback { world_size: 3 }), 1, 1, 3)?;
        assert_eq!(dist.world_size(), 3);
        assert!(!dist.is_main());
        let x = Tensor::arange(0f32, 6., &Device::Cpu)?.reshape((2, 3))?;
        let gathered = dist.gather_concat(&x)?;
        assert_eq!(gathered.dims(), [6, 3]);
        dist.shutdown()?;
        Ok(())
    }

    #[test]
    fn invalid_rank_is_rejected() {
        assert!(Distributed::init(Box::new(Loopback { world_size: 2 }), 2, 0, 2).is_err());
    }
}
