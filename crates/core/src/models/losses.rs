//! Loss functions for the contrastive, matching and captioning objectives.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::ops::log_softmax;

/// Cross-entropy with label smoothing, averaged over rows.
///
/// `logits`: `[N, C]`, `targets`: `[N]` u32. With `smoothing = ε` the loss per
/// row is `(1-ε)·nll + ε·mean_c(-log p_c)`.
pub fn cross_entropy_smoothed(logits: &Tensor, targets: &Tensor, smoothing: f64) -> Result<Tensor> {
    per_row_cross_entropy(logits, targets, smoothing)?.mean_all()
}

fn per_row_cross_entropy(logits: &Tensor, targets: &Tensor, smoothing: f64) -> Result<Tensor> {
    let log_probs = log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let nll = log_probs
        .gather(&targets.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?
        .neg()?;
    if smoothing == 0.0 {
        return Ok(nll);
    }
    let uniform = log_probs.mean(D::Minus1)?.neg()?;
    (nll * (1.0 - smoothing))? + (uniform * smoothing)?
}

/// `-(log_softmax(logits) * targets).sum(-1).mean()` for soft targets.
pub fn soft_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    log_softmax(logits, D::Minus1)?
        .mul(targets)?
        .sum(D::Minus1)?
        .neg()?
        .mean_all()
}

/// Contrastive targets from image ids: rows sum to one over positives, then
/// mixed with a uniform distribution as `0.9·t + 0.1/N`.
///
/// `ids`: `[B]` u32 (local), `ids_all`: `[N]` u32 (gathered). Returns `[B, N]`.
pub fn itc_soft_targets(ids: &Tensor, ids_all: &Tensor) -> Result<Tensor> {
    let pos = same_id_mask(ids, ids_all)?.to_dtype(DType::F32)?;
    let n = pos.dim(1)?;
    let targets = pos.broadcast_div(&pos.sum_keepdim(1)?)?;
    (targets * 0.9)? + 0.1 / n as f64
}

/// `[B, N]` u8 mask, set where `ids[b] == ids_all[n]`.
pub fn same_id_mask(ids: &Tensor, ids_all: &Tensor) -> Result<Tensor> {
    let b = ids.elem_count();
    let n = ids_all.elem_count();
    let ids = ids.reshape((b, 1))?.broadcast_as((b, n))?;
    let all = ids_all.reshape((1, n))?.broadcast_as((b, n))?;
    ids.eq(&all)
}

/// `[B, N]` u8 mask with the diagonal of the local block set:
/// entry `(b, offset + b)` for each row.
pub fn diagonal_block_mask(rows: usize, cols: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<u8> = (0..rows)
        .flat_map(|r| (0..cols).map(move |c| u8::from(c == offset + r)))
        .collect();
    Tensor::from_vec(mask, (rows, cols), device)
}

/// ITM labels: `B` positives followed by `2B` negatives.
pub fn itm_labels(batch: usize, device: &Device) -> Result<Tensor> {
    let labels: Vec<u32> = std::iter::repeat(1)
        .take(batch)
        .chain(std::iter::repeat(0).take(2 * batch))
        .collect();
    Tensor::from_vec(labels, 3 * batch, device)
}

/// Shifted next-token loss for captioning.
///
/// Position `t` predicts label `t + 1`. `ignore` (`[B, T]` u8) marks labels
/// excluded from the mean. Label smoothing applies per token.
pub fn lm_loss(logits: &Tensor, labels: &Tensor, ignore: &Tensor, smoothing: f64) -> Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    if t < 2 {
        return Tensor::zeros((), DType::F32, logits.device());
    }
    let shifted_logits = logits.narrow(1, 0, t - 1)?.reshape((b * (t - 1), v))?;
    let shifted_labels = labels.narrow(1, 1, t - 1)?.reshape(b * (t - 1))?;
    let keep = ignore
        .narrow(1, 1, t - 1)?
        .reshape(b * (t - 1))?
        .eq(0u8)?
        .to_dtype(DType::F32)?;

    let per_token = per_row_cross_entropy(&shifted_logits, &shifted_labels, smoothing)?;
    let count = keep.sum_all()?.maximum(1f32)?;
    (per_token * &keep)?.sum_all()?.div(&count)
}

/// Mean over the `N` axis of `[B, N, C]`, skipping positions set in `mask`
/// (`[B, 1, 1, N]` u8).
pub fn masked_mean(xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (b, n, _) = xs.dims3()?;
    let keep = mask
        .reshape((b, n, 1))?
        .eq(0u8)?
        .to_dtype(xs.dtype())?;
    let total = xs.broadcast_mul(&keep)?.sum(1)?;
    let count = keep.sum(1)?.maximum(1f32)?;
    total.broadcast_div(&count)
}

/// L2-normalize along the last dimension.
pub fn l2_normalize(xs: &Tensor) -> Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12f32)?;
    xs.broadcast_div(&norm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn cross_entropy_matches_candle_without_smoothing() {
        let logits = Tensor::new(&[[2.0f32, 0.5, -1.0], [0.1, 0.2, 0.3]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        let ours = cross_entropy_smoothed(&logits, &targets, 0.0).unwrap();
        let theirs = candle_nn::loss::cross_entropy(&logits, &targets).unwrap();
        assert!((scalar(&ours) - scalar(&theirs)).abs() < 1e-6);
    }

    #[test]
    fn smoothing_on_uniform_logits_is_log_c() {
        let logits = Tensor::zeros((2, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[1u32, 3], &Device::Cpu).unwrap();
        let loss = cross_entropy_smoothed(&logits, &targets, 0.1).unwrap();
        assert!((scalar(&loss) - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn soft_targets_rows_sum_to_one() {
        let ids = Tensor::new(&[7u32, 8], &Device::Cpu).unwrap();
        let all = Tensor::new(&[7u32, 8, 7, 9], &Device::Cpu).unwrap();
        let t = itc_soft_targets(&ids, &all).unwrap().to_vec2::<f32>().unwrap();
        for row in &t {
            let s: f32 = row.iter().sum();
            assert!((s - 1.0).abs() < 1e-5);
        }
        // two positives share 0.9, plus 0.1/4 everywhere
        assert!((t[0][0] - 0.475).abs() < 1e-6);
        assert!((t[0][2] - 0.475).abs() < 1e-6);
        assert!((t[0][1] - 0.025).abs() < 1e-6);
        assert!((t[1][1] - 0.925).abs() < 1e-6);
    }

    #[test]
    fn diagonal_block_offsets_by_rank() {
        let m = diagonal_block_mask(2, 6, 2, &Device::Cpu).unwrap();
        assert_eq!(
            m.to_vec2::<u8>().unwrap(),
            vec![vec![0, 0, 1, 0, 0, 0], vec![0, 0, 0, 1, 0, 0]]
        );
    }

    #[test]
    fn itm_label_layout() {
        let l = itm_labels(2, &Device::Cpu).unwrap();
        assert_eq!(l.to_vec1::<u32>().unwrap(), vec![1, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn lm_loss_ignores_padding() {
        let device = Device::Cpu;
        // vocab 3, perfect prediction of token 1 at every step
        let step = [[-10.0f32, 10.0, -10.0]; 3];
        let logits = Tensor::new(&[step], &device).unwrap();
        let labels = Tensor::new(&[[0u32, 1, 1]], &device).unwrap();
        let none = Tensor::zeros((1, 3), DType::U8, &device).unwrap();
        let loss = lm_loss(&logits, &labels, &none, 0.0).unwrap();
        assert!(scalar(&loss) < 1e-4);

        // a badly predicted label contributes only when not ignored
        let labels = Tensor::new(&[[0u32, 1, 2]], &device).unwrap();
        let bad = lm_loss(&logits, &labels, &none, 0.0).unwrap();
        assert!(scalar(&bad) > 5.0);
        let ignore = Tensor::new(&[[0u8, 0, 1]], &device).unwrap();
        let masked = lm_loss(&logits, &labels, &ignore, 0.0).unwrap();
        assert!(scalar(&masked) < 1e-4);
    }

    #[test]
    fn masked_mean_skips_masked_tokens() {
        let xs = Tensor::new(&[[[1.0f32, 2.0], [3.0, 4.0], [100.0, 100.0]]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[0u8, 0, 1], &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 1, 3))
            .unwrap();
        let m = masked_mean(&xs, &mask).unwrap();
        assert_eq!(m.to_vec2::<f32>().unwrap(), vec![vec![2.0, 3.0]]);
    }

    #[test]
    fn l2_normalize_unit_rows() {
        let xs = Tensor::new(&[[3.0f32, 4.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let n = l2_normalize(&xs).unwrap().to_vec2::<f32>().unwrap();
        assert!((n[0][0] - 0.6).abs() < 1e-6 && (n[0][1] - 0.8).abs() < 1e-6);
        assert!(n[1].iter().all(|v| v.is_finite()));
    }
}
