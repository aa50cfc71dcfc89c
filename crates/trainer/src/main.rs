use std::path::PathBuf;

use clap::{Parser, Subcommand};
use daiv_core::models::GenerateParams;

use daiv_trainer::config::RunConfig;
use daiv_trainer::logging::{self, LogFormat};
use daiv_trainer::run;

#[derive(Parser)]
#[command(name = "daiv-trainer", about = "BLIP-2 / MCAN vision-language pretraining")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

/// Options shared by every command that builds a model.
#[derive(clap::Args)]
struct ModelArgs {
    /// Run config file (default: ~/.config/daiv/run.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Registered model name
    #[arg(long)]
    model: Option<String>,

    /// Model preset (pretrain, pretrain_vitL, coco)
    #[arg(long)]
    model_type: Option<String>,

    /// Model config file, overrides the preset
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// cpu or cuda
    #[arg(long)]
    device: Option<String>,

    /// Directory holding configs/
    #[arg(long)]
    repo_root: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,
}

impl ModelArgs {
    /// File config overlaid with the CLI values.
    fn resolve(&self) -> anyhow::Result<RunConfig> {
        let mut cfg = match &self.config {
            Some(path) => RunConfig::load_from(path)?,
            None => RunConfig::load(),
        };
        cfg.merge(&RunConfig {
            model: self.model.clone(),
            model_type: self.model_type.clone(),
            model_config: self.model_config.clone(),
            device: self.device.clone(),
            repo_root: self.repo_root.clone(),
            seed: self.seed,
            ..Default::default()
        });
        Ok(cfg)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Pretrain on the configured datasets
    Train {
        #[command(flatten)]
        model: ModelArgs,

        /// Number of in-process ranks, one thread each
        #[arg(long)]
        world_size: Option<usize>,

        /// Dataset builders to train on (repeatable)
        #[arg(long = "dataset")]
        datasets: Vec<String>,

        /// Directory relative dataset paths resolve against
        #[arg(long)]
        cache_root: Option<PathBuf>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        max_epoch: Option<usize>,

        #[arg(long)]
        init_lr: Option<f64>,

        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Stop each epoch after this many steps
        #[arg(long)]
        max_steps_per_epoch: Option<usize>,
    },

    /// Caption images
    Caption {
        #[command(flatten)]
        model: ModelArgs,

        /// Image file (repeatable)
        #[arg(long = "image", required = true)]
        images: Vec<PathBuf>,

        /// Trained checkpoint to load
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Sample with top-p instead of beam search
        #[arg(long)]
        nucleus: bool,

        #[arg(long, default_value_t = 3)]
        num_beams: usize,

        #[arg(long, default_value_t = 30)]
        max_length: usize,

        #[arg(long, default_value_t = 10)]
        min_length: usize,

        #[arg(long, default_value_t = 0.9)]
        top_p: f32,

        #[arg(long, default_value_t = 1.0)]
        repetition_penalty: f32,
    },

    /// Extract image, text or multimodal features and print their shapes
    Features {
        #[command(flatten)]
        model: ModelArgs,

        /// image, text or multimodal
        #[arg(long)]
        mode: String,

        /// Image file (repeatable)
        #[arg(long = "image")]
        images: Vec<PathBuf>,

        /// Text (repeatable)
        #[arg(long = "text")]
        texts: Vec<String>,

        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// List registered dataset builders
    Builders,

    /// List registered models and their presets
    Models,

    /// Write a default run config
    InitConfig {
        /// Destination (default: ~/.config/daiv/run.toml)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, LogFormat::from_env())?;

    match cli.command {
        Command::Train {
            model,
            world_size,
            datasets,
            cache_root,
            batch_size,
            max_epoch,
            init_lr,
            output_dir,
            max_steps_per_epoch,
        } => {
            let mut cfg = model.resolve()?;
            cfg.merge(&RunConfig {
                world_size,
                datasets: (!datasets.is_empty()).then_some(datasets),
                cache_root,
                batch_size,
                max_epoch,
                init_lr,
                output_dir,
                max_steps_per_epoch,
                ..Default::default()
            });
            let summaries = run::train(&cfg)?;
            for s in summaries {
                println!(
                    "epoch {}: steps={} lr={:.3e} loss={:.4} itc={:.4} itm={:.4} lm={:.4}",
                    s.epoch,
                    s.steps,
                    s.lr,
                    s.mean.loss,
                    s.mean.loss_itc,
                    s.mean.loss_itm,
                    s.mean.loss_lm
                );
            }
            Ok(())
        }
        Command::Caption {
            model,
            images,
            checkpoint,
            nucleus,
            num_beams,
            max_length,
            min_length,
            top_p,
            repetition_penalty,
        } => {
            let cfg = model.resolve()?;
            let image_size = cfg.model_config()?.image_size;
            let blip = run::load_model(&cfg, checkpoint.as_deref())?;
            let params = GenerateParams {
                use_nucleus_sampling: nucleus,
                num_beams,
                max_length,
                min_length,
                top_p,
                repetition_penalty,
                seed: cfg.seed,
            };
            let captions = run::caption(&blip, &images, image_size, &params)?;
            for (path, caption) in images.iter().zip(captions) {
                println!("{}\t{caption}", path.display());
            }
            Ok(())
        }
        Command::Features {
            model,
            mode,
            images,
            texts,
            checkpoint,
        } => {
            let cfg = model.resolve()?;
            let image_size = cfg.model_config()?.image_size;
            let blip = run::load_model(&cfg, checkpoint.as_deref())?;
            for line in run::features(&blip, &mode, &images, &texts, image_size)? {
                println!("{line}");
            }
            Ok(())
        }
        Command::Builders => {
            for line in run::list_builders() {
                println!("{line}");
            }
            Ok(())
        }
        Command::Models => {
            for line in run::list_models() {
                println!("{line}");
            }
            Ok(())
        }
        Command::InitConfig { path, force } => {
            let path = path
                .or_else(RunConfig::default_path)
                .ok_or_else(|| anyhow::anyhow!("no config directory available"))?;
            run::init_config(&path, force)?;
            println!("wrote {}", path.display());
            Ok(())
        }
    }
}
