//! Learning-rate schedules.

use std::f64::consts::PI;

/// Linear warmup during the first `warmup_steps` steps of epoch 0, then a
/// per-epoch cosine decay from `init_lr` to `min_lr`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearWarmupCosineLr {
    pub max_epoch: usize,
    pub init_lr: f64,
    pub min_lr: f64,
    pub warmup_lr: f64,
    pub warmup_steps: usize,
}

impl LinearWarmupCosineLr {
    /// A negative `warmup_lr` starts the warmup at `init_lr`.
    pub fn new(
        max_epoch: usize,
        init_lr: f64,
        min_lr: f64,
        warmup_lr: f64,
        warmup_steps: usize,
    ) -> Self {
        Self {
            max_epoch: max_epoch.max(1),
            init_lr,
            min_lr,
            warmup_lr: if warmup_lr >= 0.0 { warmup_lr } else { init_lr },
            warmup_steps,
        }
    }

    pub fn lr(&self, epoch: usize, step: usize) -> f64 {
        if epoch == 0 && step < self.warmup_steps {
            let progress = step as f64 / self.warmup_steps.max(1) as f64;
            (self.warmup_lr + (self.init_lr - self.warmup_lr) * progress).min(self.init_lr)
        } else {
            let progress = epoch as f64 / self.max_epoch as f64;
            (self.init_lr - self.min_lr) * 0.5 * (1.0 + (PI * progress).cos()) + self.min_lr
        }
    }
}
