//! Registry of dataset builders.

use std::path::Path;

use super::builder::{BuildStrategy, VqaBuilder};
use super::config::DatasetConfig;
use super::dataset::AnnotationFormat;
use super::error::{DatasetError, Result};

/// Static description of a registered builder.
#[derive(Debug, Clone, Copy)]
pub struct BuilderInfo {
    pub name: &'static str,
    pub train_format: AnnotationFormat,
    pub eval_format: Option<AnnotationFormat>,
    pub strategy: BuildStrategy,
    /// `(config type, path relative to the repository root)`; the first entry
    /// is the default.
    pub config_paths: &'static [(&'static str, &'static str)],
}

impl BuilderInfo {
    pub fn config_path(&self, config_type: &str) -> Option<&'static str> {
        self.config_paths
            .iter()
            .find(|(t, _)| *t == config_type)
            .map(|(_, p)| *p)
    }
}

// ─── Static Catalog ──────────────────────────────────────────────────────────

static BUILDERS: &[BuilderInfo] = &[
    BuilderInfo {
        name: "ocrvqa",
        train_format: AnnotationFormat::OcrVqa,
        eval_format: None,
        strategy: BuildStrategy::SingleFile("cleaned_train_dataset.json"),
        config_paths: &[("default", "configs/datasets/ocrvqa/defaults.toml")],
    },
    BuilderInfo {
        name: "textvqa",
        train_format: AnnotationFormat::OcrVqa,
        eval_format: None,
        strategy: BuildStrategy::SingleFile("TextVQA_0.5.1_train.json"),
        config_paths: &[("default", "configs/datasets/textvqa/defaults.toml")],
    },
    BuilderInfo {
        name: "coco_vqa",
        train_format: AnnotationFormat::CocoVqa,
        eval_format: Some(AnnotationFormat::CocoVqaEval),
        strategy: BuildStrategy::SingleFile("vqa_train.json"),
        config_paths: &[
            ("default", "configs/datasets/coco/defaults_vqa.toml"),
            ("eval", "configs/datasets/coco/eval_vqa.toml"),
        ],
    },
    BuilderInfo {
        name: "vqg_coco_vqa",
        train_format: AnnotationFormat::VqgCocoVqa,
        eval_format: None,
        strategy: BuildStrategy::SingleFile("vqa_train.json"),
        config_paths: &[("default", "configs/datasets/coco/vqg.toml")],
    },
    BuilderInfo {
        name: "ok_vqa",
        train_format: AnnotationFormat::CocoVqa,
        eval_format: Some(AnnotationFormat::CocoVqaEval),
        strategy: BuildStrategy::Splits,
        config_paths: &[("default", "configs/datasets/okvqa/defaults.toml")],
    },
    BuilderInfo {
        name: "vqg_ok_vqa",
        train_format: AnnotationFormat::VqgCocoVqa,
        eval_format: None,
        strategy: BuildStrategy::SingleFile("okvqa_train.json"),
        config_paths: &[("default", "configs/datasets/okvqa/vqg.toml")],
    },
    BuilderInfo {
        name: "aok_vqa",
        train_format: AnnotationFormat::AokVqa,
        eval_format: None,
        strategy: BuildStrategy::SingleFile("aokvqa_v1p0_train.json"),
        config_paths: &[("default", "configs/datasets/aokvqa/defaults.toml")],
    },
    BuilderInfo {
        name: "vqg_aok_vqa",
        train_format: AnnotationFormat::VqgAokVqa,
        eval_format: None,
        strategy: BuildStrategy::SingleFile("aokvqa_v1p0_train.json"),
        config_paths: &[("default", "configs/datasets/aokvqa/vqg.toml")],
    },
    BuilderInfo {
        name: "llavavqa",
        train_format: AnnotationFormat::Llava,
        eval_format: None,
        strategy: BuildStrategy::SingleFile("bliva_llava_150k.json"),
        config_paths: &[("default", "configs/datasets/llava/defaults.toml")],
    },
    BuilderInfo {
        name: "docvqa",
        train_format: AnnotationFormat::DocVqa,
        eval_format: None,
        strategy: BuildStrategy::SingleFile("train_v1.0.json"),
        config_paths: &[("default", "configs/datasets/docvqa/defaults.toml")],
    },
    BuilderInfo {
        name: "stvqa",
        train_format: AnnotationFormat::StVqa,
        eval_format: None,
        strategy: BuildStrategy::SingleFile("train_task_3.json"),
        config_paths: &[("default", "configs/datasets/stvqa/defaults.toml")],
    },
];

pub fn supported_builders() -> &'static [BuilderInfo] {
    BUILDERS
}

pub fn find_builder(name: &str) -> Option<&'static BuilderInfo> {
    BUILDERS.iter().find(|b| b.name == name)
}

/// Builder `name` configured from its shipped config file under `root`.
pub fn load_builder(name: &str, config_type: Option<&str>, root: &Path) -> Result<VqaBuilder> {
    let info = find_builder(name).ok_or_else(|| DatasetError::UnknownBuilder(name.to_string()))?;
    let config_type = config_type.unwrap_or("default");
    let path = info
        .config_path(config_type)
        .ok_or_else(|| DatasetError::UnknownConfigType {
            builder: name.to_string(),
            config_type: config_type.to_string(),
        })?;
    let config = DatasetConfig::from_file(&root.join(path), name)?;
    Ok(VqaBuilder::new(info, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_names_are_unique() {
        let mut names: Vec<_> = BUILDERS.iter().map(|b| b.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), BUILDERS.len());
        assert_eq!(BUILDERS.len(), 11);
    }

    #[test]
    fn only_ok_vqa_builds_splits() {
        for b in BUILDERS {
            let splits = b.strategy == BuildStrategy::Splits;
            assert_eq!(splits, b.name == "ok_vqa", "{}", b.name);
        }
    }

    #[test]
    fn coco_vqa_has_eval_config() {
        let b = find_builder("coco_vqa").unwrap();
        assert_eq!(
            b.config_path("eval"),
            Some("configs/datasets/coco/eval_vqa.toml")
        );
        assert_eq!(b.config_path("vqg"), None);
    }

    #[test]
    fn unknown_names_are_errors() {
        let root = Path::new(".");
        assert!(matches!(
            load_builder("imagenet", None, root),
            Err(DatasetError::UnknownBuilder(_))
        ));
        assert!(matches!(
            load_builder("stvqa", Some("eval"), root),
            Err(DatasetError::UnknownConfigType { .. })
        ));
    }

    #[test]
    fn shipped_configs_parse() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        for b in BUILDERS {
            for (config_type, _) in b.config_paths {
                let builder = load_builder(b.name, Some(config_type), &root)
                    .unwrap_or_else(|e| panic!("{}/{config_type}: {e}", b.name));
                assert_eq!(builder.info().name, b.name);
            }
        }
    }
}
