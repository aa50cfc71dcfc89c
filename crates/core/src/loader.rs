use std::collections::HashSet;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::{info, warn};

use crate::tokenizer::BlipTokenizer;

/// Outcome of a non-strict checkpoint load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

/// Local tokenizer file, or a hub model id.
pub fn load_tokenizer(name_or_path: &str) -> anyhow::Result<BlipTokenizer> {
    let path = Path::new(name_or_path);
    if path.is_file() {
        BlipTokenizer::from_file(path)
    } else if path.is_dir() {
        BlipTokenizer::from_file(&path.join("tokenizer.json"))
    } else {
        BlipTokenizer::from_pretrained(name_or_path)
    }
}

/// Resolve safetensors files: a file, a directory of shards, or a hub model id.
pub fn resolve_weight_files(path_or_id: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if path_or_id.is_file() {
        return Ok(vec![path_or_id.to_path_buf()]);
    }
    if path_or_id.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path_or_id)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        files.sort_by_key(|p| natural_sort_key(&p.to_string_lossy()));
        anyhow::ensure!(
            !files.is_empty(),
            "no safetensors files in {}",
            path_or_id.display()
        );
        return Ok(files);
    }
    let model_id = path_or_id.to_string_lossy();
    let api = Api::new()?;
    let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
    load_safetensor_paths(&repo)
}

/// Creates a read-only VarBuilder from safetensor weight files.
pub fn load_weights(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> anyhow::Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Copy matching tensors from a safetensors checkpoint into `varmap`.
///
/// Names present in only one side are reported, not rejected, so a
/// pretrain checkpoint can seed a model with extra heads.
pub fn load_checkpoint(varmap: &VarMap, path: &Path) -> anyhow::Result<LoadReport> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("parameter map lock poisoned"))?;
    let device = vars
        .values()
        .next()
        .map(|v| v.device().clone())
        .unwrap_or(Device::Cpu);
    let tensors = candle_core::safetensors::load(path, &device)?;

    let mut report = LoadReport::default();
    for (name, var) in vars.iter() {
        match tensors.get(name) {
            Some(t) => {
                if t.dims() != var.dims() {
                    anyhow::bail!(
                        "checkpoint tensor {name} has shape {:?}, expected {:?}",
                        t.dims(),
                        var.dims()
                    );
                }
                var.set(&t.to_dtype(var.dtype())?)?;
                report.loaded += 1;
            }
            None => report.missing.push(name.clone()),
        }
    }
    let known: HashSet<&String> = vars.keys().collect();
    report.unexpected = tensors
        .keys()
        .filter(|k| !known.contains(k))
        .cloned()
        .collect();
    report.missing.sort();
    report.unexpected.sort();

    info!(
        path = %path.display(),
        loaded = report.loaded,
        missing = report.missing.len(),
        unexpected = report.unexpected.len(),
        "loaded checkpoint"
    );
    if !report.missing.is_empty() {
        warn!(keys = ?report.missing, "missing keys in checkpoint");
    }
    Ok(report)
}

/// Write every trainable parameter to `path`, creating parent directories.
pub fn save_checkpoint(varmap: &VarMap, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    varmap.save(path)?;
    info!(path = %path.display(), "saved checkpoint");
    Ok(())
}

/// Splits a filename into text/numeric segments so that "model-2-of-10"
/// sorts before "model-10-of-10".
fn natural_sort_key(s: &str) -> Vec<Result<u64, String>> {
    let basename = Path::new(s)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(s);
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_digits = false;
    for c in basename.chars() {
        let digit = c.is_ascii_digit();
        if !current.is_empty() && digit != in_digits {
            parts.push(segment(&current, in_digits));
            current.clear();
        }
        in_digits = digit;
        current.push(c);
    }
    if !current.is_empty() {
        parts.push(segment(&current, in_digits));
    }
    parts
}

fn segment(s: &str, digits: bool) -> Result<u64, String> {
    if digits {
        Ok(s.parse::<u64>().unwrap_or(0))
    } else {
        Err(s.to_string())
    }
}

fn load_safetensor_paths(repo: &hf_hub::api::sync::ApiRepo) -> anyhow::Result<Vec<PathBuf>> {
    if let Ok(path) = repo.get("model.safetensors") {
        return Ok(vec![path]);
    }

    let index_path = repo.get("model.safetensors.index.json")?;
    let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("missing weight_map in index"))?;

    let mut filenames: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    filenames.sort_by_key(|a| natural_sort_key(a));
    filenames.dedup();

    filenames.iter().map(|f| Ok(repo.get(f)?)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use candle_nn::Init;

    #[test]
    fn natural_sort_orders_numerically() {
        let mut files = vec![
            "model-00010-of-00020.safetensors".to_string(),
            "model-00002-of-00020.safetensors".to_string(),
            "shard-10.safetensors".to_string(),
            "shard-2.safetensors".to_string(),
        ];
        files.sort_by_key(|a| natural_sort_key(a));
        assert_eq!(
            files,
            vec![
                "model-00002-of-00020.safetensors",
                "model-00010-of-00020.safetensors",
                "shard-2.safetensors",
                "shard-10.safetensors",
            ]
        );
    }

    fn varmap_with(names: &[&str]) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for name in names {
            vb.get_with_hints((2, 3), name, Init::Const(0.0)).unwrap();
        }
        varmap
    }

    #[test]
    fn checkpoint_roundtrip_reports_missing_and_unexpected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt/model.safetensors");

        let src = varmap_with(&["a.weight", "extra.weight"]);
        src.data()
            .lock()
            .unwrap()
            .get("a.weight")
            .unwrap()
            .set(&Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        save_checkpoint(&src, &path).unwrap();

        let dst = varmap_with(&["a.weight", "b.weight"]);
        let report = load_checkpoint(&dst, &path).unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.missing, vec!["b.weight".to_string()]);
        assert_eq!(report.unexpected, vec!["extra.weight".to_string()]);

        let data = dst.data().lock().unwrap();
        let a = data.get("a.weight").unwrap().as_tensor().sum_all().unwrap();
        assert_eq!(a.to_scalar::<f32>().unwrap(), 6.0);
    }

    #[test]
    fn checkpoint_shape_mismatch_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((4,), "a.weight", Init::Const(0.0)).unwrap();
        save_checkpoint(&varmap, &path).unwrap();

        let dst = varmap_with(&["a.weight"]);
        assert!(load_checkpoint(&dst, &path).is_err());
    }

    #[test]
    fn resolve_weight_files_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["model-2.safetensors", "model-10.safetensors", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let files = resolve_weight_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["model-2.safetensors", "model-10.safetensors"]);
    }

    #[test]
    #[ignore] // requires network
    fn load_bert_tokenizer_from_hub() {
        let tok = load_tokenizer("bert-base-uncased").unwrap();
        assert_eq!(tok.vocab_size(), 30523);
    }
}
