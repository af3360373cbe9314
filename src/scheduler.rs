//! Cosine learning-rate schedule with linear warmup. The trainer feeds the
//! returned value to `candle_nn::Optimizer::set_learning_rate`.

/// Linear warmup from `min_lr` to `max_lr` over `warmup_steps`, then cosine
/// decay back to `min_lr` at `total_steps`. Every returned value is clamped
/// to `[min_lr, max_lr]`; out-of-range values are clamped silently rather
/// than reported.
#[derive(Debug, Clone)]
pub struct CosineLRSchedule {
    warmup_steps: usize,
    total_steps: usize,
    min_lr: f64,
    max_lr: f64,
    counter: usize,
}

impl CosineLRSchedule {
    pub fn new(warmup_steps: usize, total_steps: usize, min_lr: f64, max_lr: f64) -> Self {
        Self {
            warmup_steps,
            total_steps,
            min_lr,
            max_lr,
            counter: 0,
        }
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    fn clamp(&self, lr: f64) -> f64 {
        lr.clamp(self.min_lr, self.max_lr)
    }

    /// Advance one step and return the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.counter += 1;
        if self.counter <= self.warmup_steps {
            let frac = self.counter as f64 / self.warmup_steps as f64;
            return self.clamp(self.min_lr + frac * (self.max_lr - self.min_lr));
        }
        // A schedule with no decay phase sits at the floor once warmup ends.
        if self.total_steps <= self.warmup_steps {
            return self.min_lr;
        }
        let t = (self.counter - self.warmup_steps) as f64
            / (self.total_steps - self.warmup_steps) as f64;
        let lr = self.min_lr
            + 0.5 * (1. + (std::f64::consts::PI * t).cos()) * (self.max_lr - self.min_lr);
        self.clamp(lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_reaches_max() {
        let mut sched = CosineLRSchedule::new(10, 100, 1e-5, 1e-3);
        let mut last = 0.;
        for _ in 0..10 {
            last = sched.step();
        }
        assert!((last - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn decays_to_min_at_total_steps() {
        let mut sched = CosineLRSchedule::new(10, 100, 1e-5, 1e-3);
        let mut last = 0.;
        for _ in 0..100 {
            last = sched.step();
        }
        assert!((last - 1e-5).abs() < 1e-9);
    }

    #[test]
    fn clamps_past_the_end() {
        let mut sched = CosineLRSchedule::new(2, 10, 1e-5, 1e-3);
        for _ in 0..50 {
            let lr = sched.step();
            assert!((1e-5..=1e-3).contains(&lr), "lr {lr} escaped the bounds");
        }
    }

    #[test]
    fn warmup_only_schedule_stays_finite() {
        let mut sched = CosineLRSchedule::new(5, 5, 1e-5, 1e-3);
        for _ in 0..10 {
            let lr = sched.step();
            assert!(lr.is_finite());
            assert!((1e-5..=1e-3).contains(&lr), "lr {lr} escaped the bounds");
        }
    }

    #[test]
    fn warmup_is_monotonic() {
        let mut sched = CosineLRSchedule::new(5, 20, 1e-5, 1e-3);
        let mut prev = 0.;
        for _ in 0..5 {
            let lr = sched.step();
            assert!(lr > prev);
            prev = lr;
        }
    }
}
