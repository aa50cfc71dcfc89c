//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use candle_core::Tensor;
use candle_nn::VarMap;
use daiv_core::config::ModelConfig;
use daiv_core::datasets::{
    load_builder, supported_builders, BuildStrategy, ConcatDataset, DataLoader, Dataset,
    DatasetBuilder, Samples, Split,
};
use daiv_core::distributed::{single_rank, DeviceCommunicator, ThreadGroup};
use daiv_core::loader::load_tokenizer;
use daiv_core::models::registry::supported_models;
use daiv_core::models::{Blip2Mcan, GenerateParams};
use daiv_core::multimodal::{ImageProcessor, ImageProcessorKind};
use daiv_core::tokenizer::BlipTokenizer;
use daiv_core::train::{EpochSummary, Trainer};
use tracing::{info, info_span};

use crate::config::RunConfig;

/// Concatenated train splits of every configured builder.
pub fn build_train_dataset(cfg: &RunConfig) -> anyhow::Result<ConcatDataset> {
    let names = cfg
        .datasets
        .as_deref()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| anyhow!("no datasets configured"))?;
    let seed = cfg.train_config().seed;
    let mut parts: Vec<Arc<dyn Dataset>> = Vec::with_capacity(names.len());
    for name in names {
        let builder = load_builder(name, None, &cfg.repo_root())?
            .with_cache_root(cfg.cache_root())
            .with_seed(seed);
        let mut splits = builder.build_datasets()?;
        let train = splits
            .remove(&Split::Train)
            .ok_or_else(|| anyhow!("dataset {name} has no train split"))?;
        info!(dataset = %name, samples = train.len(), "train split ready");
        parts.push(Arc::new(train));
    }
    Ok(ConcatDataset::new(parts))
}

/// Train on `world_size` in-process ranks. Returns rank 0's epoch summaries.
pub fn train(cfg: &RunConfig) -> anyhow::Result<Vec<EpochSummary>> {
    let model_cfg = cfg.model_config()?;
    let tokenizer = Arc::new(load_tokenizer(&model_cfg.tokenizer)?);
    let dataset: Arc<dyn Dataset> = Arc::new(build_train_dataset(cfg)?);
    train_on(cfg, &model_cfg, tokenizer, dataset)
}

/// Train an already-built model config and dataset.
pub fn train_on(
    cfg: &RunConfig,
    model_cfg: &ModelConfig,
    tokenizer: Arc<BlipTokenizer>,
    dataset: Arc<dyn Dataset>,
) -> anyhow::Result<Vec<EpochSummary>> {
    let world_size = cfg.world_size();
    info!(world_size, samples = dataset.len(), "starting training");
    let group = ThreadGroup::new(world_size);

    let results: Vec<anyhow::Result<Vec<EpochSummary>>> = std::thread::scope(|s| {
        let handles: Vec<_> = group
            .communicators()
            .into_iter()
            .map(|comm| {
                let tokenizer = Arc::clone(&tokenizer);
                let dataset = Arc::clone(&dataset);
                std::thread::Builder::new()
                    .name(format!("rank-{}", comm.rank()))
                    .spawn_scoped(s, move || {
                        let comm: Arc<dyn DeviceCommunicator> = Arc::new(comm);
                        let guard = AbortOnExit::new(Arc::clone(&comm));
                        let result = train_rank(cfg, model_cfg, tokenizer, dataset, comm);
                        guard.finish(&result);
                        result
                    })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| match h {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("training thread panicked"))),
                Err(e) => Err(anyhow!("failed to spawn training thread: {e}")),
            })
            .collect()
    });

    let mut summaries = None;
    for (rank, result) in results.into_iter().enumerate() {
        let result = result.with_context(|| format!("rank {rank} failed"))?;
        if rank == 0 {
            summaries = Some(result);
        }
    }
    summaries.ok_or_else(|| anyhow!("no ranks ran"))
}

/// Aborts the rank's group unless the rank finished successfully, so a
/// rank that errors or panics releases peers blocked in a collective.
struct AbortOnExit {
    comm: Arc<dyn DeviceCommunicator>,
    armed: bool,
}

impl AbortOnExit {
    fn new(comm: Arc<dyn DeviceCommunicator>) -> Self {
        Self { comm, armed: true }
    }

    fn finish<T>(mut self, result: &anyhow::Result<T>) {
        if let Err(e) = result {
            self.comm.abort(&format!("{e:#}"));
        }
        self.armed = false;
    }
}

impl Drop for AbortOnExit {
    fn drop(&mut self) {
        if self.armed {
            self.comm.abort("rank panicked");
        }
    }
}

fn train_rank(
    cfg: &RunConfig,
    model_cfg: &ModelConfig,
    tokenizer: Arc<BlipTokenizer>,
    dataset: Arc<dyn Dataset>,
    comm: Arc<dyn DeviceCommunicator>,
) -> anyhow::Result<Vec<EpochSummary>> {
    let rank = comm.rank();
    let world_size = comm.world_size();
    let _span = info_span!("rank", rank).entered();
    let device = cfg.device(rank)?;
    let train_cfg = cfg.train_config();

    let varmap = VarMap::new();
    let model = Blip2Mcan::from_config(model_cfg, tokenizer, &varmap, &device, comm)?;
    let loader = DataLoader::new(dataset)
        .batch_size(train_cfg.batch_size)
        .shuffle(true)
        .seed(train_cfg.seed)
        .shard(rank, world_size)
        .drop_last(true)
        .device(device);
    let mut trainer = Trainer::new(&model, &varmap, train_cfg)?;
    Ok(trainer.train(&loader)?)
}

/// Single-rank model for inference subcommands.
pub fn load_model(cfg: &RunConfig, checkpoint: Option<&Path>) -> anyhow::Result<Blip2Mcan> {
    let mut model_cfg = cfg.model_config()?;
    if let Some(path) = checkpoint {
        model_cfg.pretrained = Some(path.to_path_buf());
        model_cfg.load_finetuned = false;
    }
    let tokenizer = Arc::new(load_tokenizer(&model_cfg.tokenizer)?);
    let device = cfg.device(0)?;
    // Parameters stay alive through the model's tensors.
    let varmap = VarMap::new();
    let model = Blip2Mcan::from_config(&model_cfg, tokenizer, &varmap, &device, single_rank())?;
    model.set_train(false);
    Ok(model)
}

fn load_images(model: &Blip2Mcan, paths: &[PathBuf], image_size: usize) -> anyhow::Result<Tensor> {
    let processor = ImageProcessor::new(ImageProcessorKind::BlipEval, image_size);
    let images = paths
        .iter()
        .map(|p| processor.load(p, model.device()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Tensor::stack(&images, 0)?)
}

/// Caption each image.
pub fn caption(
    model: &Blip2Mcan,
    images: &[PathBuf],
    image_size: usize,
    params: &GenerateParams,
) -> anyhow::Result<Vec<String>> {
    let image = load_images(model, images, image_size)?;
    let samples = Samples {
        image: Some(image),
        text_input: Vec::new(),
        text_output: Vec::new(),
        image_id: None,
    };
    Ok(model.generate(&samples, params)?)
}

/// One line per produced feature: name, shape and mean L2 norm over the
/// last dimension.
pub fn features(
    model: &Blip2Mcan,
    mode: &str,
    images: &[PathBuf],
    texts: &[String],
    image_size: usize,
) -> anyhow::Result<Vec<String>> {
    let image = if images.is_empty() {
        None
    } else {
        Some(load_images(model, images, image_size)?)
    };
    let samples = Samples {
        image,
        text_input: texts.to_vec(),
        text_output: Vec::new(),
        image_id: None,
    };
    let out = model.extract_features(&samples, mode)?;
    let named = [
        ("image_embeds", &out.image_embeds),
        ("image_embeds_proj", &out.image_embeds_proj),
        ("text_embeds", &out.text_embeds),
        ("text_embeds_proj", &out.text_embeds_proj),
        ("multimodal_embeds", &out.multimodal_embeds),
    ];
    let mut lines = Vec::new();
    for (name, tensor) in named {
        if let Some(t) = tensor {
            lines.push(format!("{name}: {:?} norm={:.4}", t.dims(), mean_norm(t)?));
        }
    }
    Ok(lines)
}

fn mean_norm(t: &Tensor) -> candle_core::Result<f32> {
    let last = t.rank().saturating_sub(1);
    t.sqr()?.sum_keepdim(last)?.sqrt()?.mean_all()?.to_scalar::<f32>()
}

/// One line per registered dataset builder.
pub fn list_builders() -> Vec<String> {
    supported_builders()
        .iter()
        .map(|b| {
            let strategy = match b.strategy {
                BuildStrategy::SingleFile(file) => format!("train <- {file}"),
                BuildStrategy::Splits => "train/val/test from config".to_string(),
            };
            let configs: Vec<_> = b.config_paths.iter().map(|(t, p)| format!("{t}={p}")).collect();
            format!("{:<14} {:<28} {}", b.name, strategy, configs.join(", "))
        })
        .collect()
}

/// One line per registered model with its presets, default first.
pub fn list_models() -> Vec<String> {
    supported_models()
        .iter()
        .map(|m| {
            let presets: Vec<_> = m
                .presets
                .iter()
                .map(|p| {
                    let mark = if p.model_type == m.default_model_type { "*" } else { "" };
                    format!("{}{mark}={}", p.model_type, p.config_path)
                })
                .collect();
            format!("{:<26} {:<16} {}", m.names.join(","), m.display_name, presets.join(", "))
        })
        .collect()
}

/// Write the default run config, refusing to overwrite.
pub fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        return Err(anyhow!("{} exists, pass --force to overwrite", path.display()));
    }
    RunConfig::template().save_to(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_listed() {
        let lines = list_builders();
        assert_eq!(lines.len(), 11);
        assert!(lines.iter().any(|l| l.starts_with("ok_vqa") && l.contains("train/val/test")));
        assert!(lines.iter().any(|l| l.contains("bliva_llava_150k.json")));
    }

    #[test]
    fn models_listed_with_default_preset() {
        let lines = list_models();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("blip2,blip2_feature_extractor"));
        assert!(lines[0].contains("pretrain*=configs/models/blip2_pretrain.toml"));
    }

    #[test]
    fn init_config_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        init_config(&path, false).unwrap();
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();
        assert_eq!(RunConfig::load_from(&path).unwrap(), RunConfig::template());
    }

    #[test]
    fn failed_or_panicked_rank_releases_peer() {
        for fail in [true, false] {
            let group = ThreadGroup::new(2);
            let mut comms = group.communicators().into_iter();
            let (Some(first), Some(second)) = (comms.next(), comms.next()) else {
                panic!("two communicators");
            };
            let waiter = std::thread::spawn(move || first.barrier());
            let comm: Arc<dyn DeviceCommunicator> = Arc::new(second);
            let guard = AbortOnExit::new(comm);
            if fail {
                guard.finish::<()>(&Err(anyhow!("missing image")));
            } else {
                drop(guard);
            }
            let err = waiter.join().unwrap().unwrap_err().to_string();
            let expected = if fail { "missing image" } else { "panicked" };
            assert!(err.contains(expected), "{err}");
        }
    }

    #[test]
    fn successful_rank_leaves_group_usable() {
        let group = ThreadGroup::new(2);
        let mut comms = group.communicators().into_iter();
        let (Some(first), Some(second)) = (comms.next(), comms.next()) else {
            panic!("two communicators");
        };
        let comm: Arc<dyn DeviceCommunicator> = Arc::new(second);
        AbortOnExit::new(Arc::clone(&comm)).finish(&Ok(()));
        let waiter = std::thread::spawn(move || first.barrier());
        assert!(comm.barrier().is_ok());
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn empty_dataset_list_is_error() {
        let cfg = RunConfig {
            datasets: Some(Vec::new()),
            ..Default::default()
        };
        assert!(build_train_dataset(&cfg).is_err());
    }
}
