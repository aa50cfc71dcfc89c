//! Data-parallel pretraining loop.

use std::path::{Path, PathBuf};

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::scheduler::LinearWarmupCosineLr;
use super::TrainError;
use crate::datasets::DataLoader;
use crate::distributed::ReduceOp;
use crate::models::{Blip2Mcan, LossValues};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub max_epoch: usize,
    /// Per-rank batch size.
    pub batch_size: usize,
    pub init_lr: f64,
    pub min_lr: f64,
    /// Warmup start; negative means `init_lr`.
    pub warmup_lr: f64,
    pub warmup_steps: usize,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub log_freq: usize,
    pub seed: u64,
    pub output_dir: PathBuf,
    /// Cut every epoch short after this many steps.
    pub max_steps_per_epoch: Option<usize>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            max_epoch: 10,
            batch_size: 32,
            init_lr: 1e-4,
            min_lr: 1e-5,
            warmup_lr: 1e-6,
            warmup_steps: 5000,
            weight_decay: 0.05,
            beta1: 0.9,
            beta2: 0.999,
            log_freq: 50,
            seed: 42,
            output_dir: PathBuf::from("output"),
            max_steps_per_epoch: None,
        }
    }
}

impl TrainConfig {
    pub fn scheduler(&self) -> LinearWarmupCosineLr {
        LinearWarmupCosineLr::new(
            self.max_epoch,
            self.init_lr,
            self.min_lr,
            self.warmup_lr,
            self.warmup_steps,
        )
    }

    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.output_dir.join(format!("checkpoint_{epoch}.safetensors"))
    }
}

/// Mean losses over one epoch on this rank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub steps: usize,
    pub lr: f64,
    pub mean: LossValues,
}

#[derive(Default)]
struct LossMeter {
    sum: LossValues,
    count: usize,
}

impl LossMeter {
    fn update(&mut self, v: LossValues) {
        self.sum.loss += v.loss;
        self.sum.loss_itc += v.loss_itc;
        self.sum.loss_itm += v.loss_itm;
        self.sum.loss_lm += v.loss_lm;
        self.count += 1;
    }

    fn mean(&self) -> LossValues {
        let n = self.count.max(1) as f32;
        LossValues {
            loss: self.sum.loss / n,
            loss_itc: self.sum.loss_itc / n,
            loss_itm: self.sum.loss_itm / n,
            loss_lm: self.sum.loss_lm / n,
        }
    }
}

/// Trains the parameters in a [`VarMap`] with AdamW.
///
/// Weights with fewer than two dimensions, biases and norms are not decayed.
/// On more than one rank, rank 0's initial parameters are broadcast first
/// and gradients are averaged before every step.
pub struct Trainer<'a> {
    model: &'a Blip2Mcan,
    varmap: &'a VarMap,
    config: TrainConfig,
    scheduler: LinearWarmupCosineLr,
    /// Sorted by name so every rank reduces in the same order.
    params: Vec<(String, Var)>,
    decay: AdamW,
    no_decay: AdamW,
}

fn skip_decay(name: &str, var: &Var) -> bool {
    var.as_tensor().rank() < 2
        || name.ends_with(".bias")
        || name.contains("ln_")
        || name.contains("norm")
}

fn sorted_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>, TrainError> {
    let mut vars: Vec<(String, Var)> = varmap
        .data()
        .lock()
        .map_err(|_| TrainError::Poisoned)?
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

impl<'a> Trainer<'a> {
    pub fn new(
        model: &'a Blip2Mcan,
        varmap: &'a VarMap,
        config: TrainConfig,
    ) -> Result<Self, TrainError> {
        let params = sorted_vars(varmap)?;
        let scheduler = config.scheduler();
        let adam = |weight_decay: f64| ParamsAdamW {
            lr: scheduler.lr(0, 0),
            beta1: config.beta1,
            beta2: config.beta2,
            eps: 1e-8,
            weight_decay,
        };
        let (plain, decayed): (Vec<_>, Vec<_>) =
            params.iter().partition(|(name, var)| skip_decay(name, var));
        let num_decay = decayed.len();
        let num_no_decay = plain.len();
        let decay = AdamW::new(
            decayed.into_iter().map(|(_, v)| v.clone()).collect(),
            adam(config.weight_decay),
        )?;
        let no_decay = AdamW::new(plain.into_iter().map(|(_, v)| v.clone()).collect(), adam(0.0))?;
        let num_elements: usize = params.iter().map(|(_, v)| v.as_tensor().elem_count()).sum();
        info!(num_decay, num_no_decay, num_elements, "optimizer parameter groups");

        Ok(Self {
            model,
            varmap,
            config,
            scheduler,
            params,
            decay,
            no_decay,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Overwrite every rank's parameters, frozen ViT included, with rank 0's.
    pub fn sync_parameters(&self) -> Result<(), TrainError> {
        let comm = self.model.communicator();
        if comm.world_size() <= 1 {
            return Ok(());
        }
        let frozen = match self.model.frozen_vision_params() {
            Some(map) => sorted_vars(map)?,
            None => Vec::new(),
        };
        for (_, var) in self.params.iter().chain(frozen.iter()) {
            let value = comm.broadcast(var.as_tensor(), 0)?;
            var.set(&value)?;
        }
        comm.barrier()?;
        Ok(())
    }

    /// Average gradients across ranks. A parameter without a gradient on
    /// this rank contributes zeros.
    fn reduce_gradients(&self, grads: &mut GradStore) -> Result<(), TrainError> {
        let comm = self.model.communicator();
        if comm.world_size() <= 1 {
            return Ok(());
        }
        for (_, var) in &self.params {
            let tensor = var.as_tensor();
            let grad = match grads.get(tensor) {
                Some(g) => g.clone(),
                None => tensor.zeros_like()?,
            };
            let reduced = comm.all_reduce(&grad, ReduceOp::Average)?;
            grads.insert(tensor, reduced);
        }
        Ok(())
    }

    fn set_lr(&mut self, lr: f64) {
        self.decay.set_learning_rate(lr);
        self.no_decay.set_learning_rate(lr);
    }

    pub fn learning_rate(&self) -> f64 {
        self.decay.learning_rate()
    }

    /// One optimization step.
    pub fn train_step(
        &mut self,
        samples: &crate::datasets::Samples,
        epoch: usize,
        step: usize,
    ) -> Result<LossValues, TrainError> {
        let lr = self.scheduler.lr(epoch, step);
        self.set_lr(lr);

        let output = self.model.forward(samples)?;
        let values = output.values()?;
        if !values.is_finite() {
            warn!(epoch, step, ?values, "non-finite loss");
        }
        let mut grads = output.loss.backward()?;
        self.reduce_gradients(&mut grads)?;
        self.decay.step(&grads)?;
        self.no_decay.step(&grads)?;
        Ok(values)
    }

    pub fn train_epoch(
        &mut self,
        loader: &DataLoader,
        epoch: usize,
    ) -> Result<EpochSummary, TrainError> {
        self.model.set_train(true);
        let rank = self.model.communicator().rank();
        let limit = self.config.max_steps_per_epoch.unwrap_or(usize::MAX);
        let total = loader.num_batches().min(limit);
        let mut meter = LossMeter::default();

        for (step, batch) in loader.epoch(epoch).take(limit).enumerate() {
            let samples = batch?;
            let values = self.train_step(&samples, epoch, step)?;
            meter.update(values);
            if rank == 0 && self.config.log_freq > 0 && step % self.config.log_freq == 0 {
                info!(
                    epoch,
                    step,
                    total,
                    lr = self.learning_rate(),
                    loss = values.loss,
                    loss_itc = values.loss_itc,
                    loss_itm = values.loss_itm,
                    loss_lm = values.loss_lm,
                    "train"
                );
            }
        }

        let summary = EpochSummary {
            epoch,
            steps: meter.count,
            lr: self.learning_rate(),
            mean: meter.mean(),
        };
        if rank == 0 {
            info!(
                epoch,
                steps = summary.steps,
                loss = summary.mean.loss,
                loss_itc = summary.mean.loss_itc,
                loss_itm = summary.mean.loss_itm,
                loss_lm = summary.mean.loss_lm,
                "epoch finished"
            );
        }
        Ok(summary)
    }

    /// Run every epoch, saving a checkpoint on rank 0 after each one.
    ///
    /// A failure on this rank aborts the communicator so peers waiting in a
    /// collective return an error instead of blocking.
    pub fn train(&mut self, loader: &DataLoader) -> Result<Vec<EpochSummary>, TrainError> {
        let result = self.run_epochs(loader);
        if let Err(e) = &result {
            let comm = self.model.communicator();
            warn!(rank = comm.rank(), error = %e, "training failed, aborting group");
            comm.abort(&e.to_string());
        }
        result
    }

    fn run_epochs(&mut self, loader: &DataLoader) -> Result<Vec<EpochSummary>, TrainError> {
        self.sync_parameters()?;
        let mut summaries = Vec::with_capacity(self.config.max_epoch);
        for epoch in 0..self.config.max_epoch {
            summaries.push(self.train_epoch(loader, epoch)?);
            let path = self.config.checkpoint_path(epoch);
            self.save_checkpoint(&path)?;
        }
        Ok(summaries)
    }

    /// Save trainable parameters. Only rank 0 writes; all ranks wait.
    pub fn save_checkpoint(&self, path: &Path) -> Result<(), TrainError> {
        let comm = self.model.communicator();
        if comm.rank() == 0 {
            crate::loader::save_checkpoint(self.varmap, path)
                .map_err(|e| TrainError::Checkpoint(e.to_string()))?;
            info!(path = %path.display(), "saved checkpoint");
        }
        if comm.world_size() > 1 {
            comm.barrier()?;
        }
        debug!(rank = comm.rank(), "checkpoint barrier passed");
        Ok(())
    }

    /// Mean of every trainable parameter, for cross-rank consistency checks.
    pub fn parameter_checksum(&self) -> Result<f32, TrainError> {
        let mut total = 0f32;
        for (_, var) in &self.params {
            let t: &Tensor = var.as_tensor();
            total += t.to_dtype(candle_core::DType::F32)?.sum_all()?.to_scalar::<f32>()?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    use super::*;
    use crate::datasets::{Dataset, DatasetError, VqaSample};
    use crate::distributed::single_rank;
    use crate::testing::{test_tokenizer, tiny_blip2_config};

    struct Captions;

    const CAPTIONS: &[&str] = &["a dog on the grass", "two cats", "a red bus", "the man"];

    impl Dataset for Captions {
        fn len(&self) -> usize {
            CAPTIONS.len()
        }

        fn get(&self, index: usize, device: &Device) -> crate::datasets::error::Result<VqaSample> {
            let caption = CAPTIONS
                .get(index)
                .ok_or(DatasetError::OutOfRange { index, len: CAPTIONS.len() })?;
            Ok(VqaSample {
                image: Tensor::randn(0f32, 1.0, (3, 16, 16), device)?,
                text_input: caption.to_string(),
                text_output: String::new(),
                answers: Vec::new(),
                weights: Vec::new(),
                image_id: index as u32,
                question_id: None,
            })
        }
    }

    fn build(varmap: &VarMap) -> Blip2Mcan {
        let tokenizer = Arc::new(test_tokenizer());
        let cfg = tiny_blip2_config(tokenizer.vocab_size());
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        Blip2Mcan::new(&cfg, tokenizer, vb, single_rank()).unwrap()
    }

    fn config(dir: &Path) -> TrainConfig {
        TrainConfig {
            max_epoch: 2,
            batch_size: 2,
            init_lr: 1e-3,
            warmup_steps: 1,
            log_freq: 1,
            output_dir: dir.to_path_buf(),
            ..TrainConfig::default()
        }
    }

    #[test]
    fn decay_groups() {
        let varmap = VarMap::new();
        let _model = build(&varmap);
        let data = varmap.data().lock().unwrap();
        let temp = &data["temp"];
        assert!(skip_decay("temp", temp));
        let proj = &data["vision_proj.weight"];
        assert!(!skip_decay("vision_proj.weight", proj));
        assert!(skip_decay("vision_proj.bias", &data["vision_proj.bias"]));
    }

    #[test]
    fn train_updates_params_and_saves_each_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let varmap = VarMap::new();
        let model = build(&varmap);
        let cfg = config(dir.path());
        let loader = DataLoader::new(Arc::new(Captions)).batch_size(cfg.batch_size);

        let mut trainer = Trainer::new(&model, &varmap, cfg.clone()).unwrap();
        let before = trainer.parameter_checksum().unwrap();
        let summaries = trainer.train(&loader).unwrap();
        let after = trainer.parameter_checksum().unwrap();

        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|s| s.steps == 2 && s.mean.is_finite()));
        assert_ne!(before, after);
        assert!(cfg.checkpoint_path(0).exists());
        assert!(cfg.checkpoint_path(1).exists());
    }

    #[test]
    fn warmup_lr_applies_on_first_step() {
        let dir = tempfile::tempdir().unwrap();
        let varmap = VarMap::new();
        let model = build(&varmap);
        let cfg = TrainConfig {
            warmup_steps: 10,
            ..config(dir.path())
        };
        let loader = DataLoader::new(Arc::new(Captions))
            .batch_size(2)
            .drop_last(true);
        let mut trainer = Trainer::new(&model, &varmap, cfg.clone()).unwrap();
        let samples = loader.epoch(0).next().unwrap().unwrap();
        trainer.train_step(&samples, 0, 0).unwrap();
        assert!((trainer.learning_rate() - cfg.warmup_lr).abs() < 1e-12);
    }

    #[test]
    fn epoch_can_be_cut_short() {
        let dir = tempfile::tempdir().unwrap();
        let varmap = VarMap::new();
        let model = build(&varmap);
        let cfg = TrainConfig {
            max_steps_per_epoch: Some(1),
            ..config(dir.path())
        };
        let loader = DataLoader::new(Arc::new(Captions)).batch_size(2);
        let mut trainer = Trainer::new(&model, &varmap, cfg).unwrap();
        let summary = trainer.train_epoch(&loader, 0).unwrap();
        assert_eq!(summary.steps, 1);
    }
}
