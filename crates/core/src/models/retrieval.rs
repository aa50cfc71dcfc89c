//! Image-text retrieval: ITC shortlist re-ranked by ITM, and recall metrics.

use candle_core::{DType, Tensor};
use tracing::{debug, info};

use super::{Blip2Mcan, ModelError};
use crate::distributed::ReduceOp;

const TEXT_BATCH: usize = 256;
const TEXT_MAX_LEN: usize = 35;
const UNRANKED: f32 = -100.0;

/// Retrieval scores, `i2t[image][text]` and `t2i[text][image]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatrices {
    pub i2t: Vec<Vec<f32>>,
    pub t2i: Vec<Vec<f32>>,
}

/// Score every image against every text.
///
/// For each image, the `k_test` texts with the highest ITC similarity get
/// `itm + sim`; everything else stays at -100. Texts are scored the same way
/// against images. Rows are split across ranks and summed.
pub fn compute_sim_matrix<I>(
    model: &Blip2Mcan,
    image_batches: I,
    texts: &[String],
    k_test: usize,
) -> Result<SimilarityMatrices, ModelError>
where
    I: IntoIterator<Item = Tensor>,
{
    let device = model.device().clone();
    let comm = model.communicator();

    info!(texts = texts.len(), "computing text features for retrieval");
    let mut text_ids = Vec::new();
    let mut text_atts = Vec::new();
    let mut text_feats = Vec::new();
    for chunk in texts.chunks(TEXT_BATCH) {
        let tokens = model
            .tokenizer()
            .encode_batch_fixed(chunk, TEXT_MAX_LEN, &device)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))?;
        text_feats.push(model.text_feats(&tokens)?);
        text_ids.push(tokens.input_ids);
        text_atts.push(tokens.attention_mask);
    }
    if text_feats.is_empty() {
        return Err(ModelError::MissingInput("text_input"));
    }
    let text_ids = Tensor::cat(&text_ids, 0)?;
    let text_atts = Tensor::cat(&text_atts, 0)?;
    let text_feats = Tensor::cat(&text_feats, 0)?;

    let mut image_inputs = Vec::new();
    let mut image_feats = Vec::new();
    for image in image_batches {
        let (inputs, feat) = model.image_feats(&image)?;
        image_inputs.push(inputs);
        image_feats.push(feat);
    }
    if image_feats.is_empty() {
        return Err(ModelError::MissingInput("image"));
    }
    let image_inputs = Tensor::cat(&image_inputs, 0)?;
    let image_feats = Tensor::cat(&image_feats, 0)?;

    let sim_i2t = image_feats.matmul(&text_feats.t()?)?;
    let sim_t2i = sim_i2t.t()?.contiguous()?;
    let sim_i2t_host = sim_i2t.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let sim_t2i_host = sim_t2i.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let (num_images, num_texts) = (sim_i2t_host.len(), sim_t2i_host.len());
    debug!(num_images, num_texts, "ITC similarities");

    let (rank, world) = (comm.rank(), comm.world_size());

    let mut i2t = vec![vec![0f32; num_texts]; num_images];
    for (i, row) in sim_i2t_host.iter().enumerate() {
        if i % world != rank {
            continue;
        }
        let top = top_k(row, k_test);
        let idx = index_tensor(&top, &device)?;
        let k = top.len();
        let image = image_inputs.narrow(0, i, 1)?;
        let image = image.broadcast_as(rep_shape(&image, k)?)?.contiguous()?;
        let itm = model.compute_itm(
            &image,
            &text_ids.index_select(&idx, 0)?,
            &text_atts.index_select(&idx, 0)?,
        )?;
        fill_row(&mut i2t[i], row, &top, &itm.to_vec1::<f32>()?);
    }

    let mut t2i = vec![vec![0f32; num_images]; num_texts];
    for (t, row) in sim_t2i_host.iter().enumerate() {
        if t % world != rank {
            continue;
        }
        let top = top_k(row, k_test);
        let idx = index_tensor(&top, &device)?;
        let k = top.len();
        let ids = text_ids.narrow(0, t, 1)?;
        let atts = text_atts.narrow(0, t, 1)?;
        let itm = model.compute_itm(
            &image_inputs.index_select(&idx, 0)?,
            &ids.broadcast_as((k, ids.dim(1)?))?.contiguous()?,
            &atts.broadcast_as((k, atts.dim(1)?))?.contiguous()?,
        )?;
        fill_row(&mut t2i[t], row, &top, &itm.to_vec1::<f32>()?);
    }

    if world > 1 {
        i2t = reduce_rows(comm, i2t, &device)?;
        t2i = reduce_rows(comm, t2i, &device)?;
    }
    Ok(SimilarityMatrices { i2t, t2i })
}

fn rep_shape(t: &Tensor, k: usize) -> candle_core::Result<(usize, usize, usize)> {
    let (_, n, h) = t.dims3()?;
    Ok((k, n, h))
}

fn index_tensor(idx: &[usize], device: &candle_core::Device) -> candle_core::Result<Tensor> {
    let idx: Vec<u32> = idx.iter().map(|&i| i as u32).collect();
    Tensor::new(idx.as_slice(), device)
}

/// Indices of the `k` largest values, best first.
fn top_k(row: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..row.len()).collect();
    idx.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or(std::cmp::Ordering::Equal));
    idx.truncate(k.min(row.len()));
    idx
}

fn fill_row(out: &mut [f32], sim: &[f32], top: &[usize], itm: &[f32]) {
    out.iter_mut().for_each(|v| *v = UNRANKED);
    for (&j, &score) in top.iter().zip(itm) {
        out[j] = score + sim[j];
    }
}

/// Each rank owns a disjoint set of rows and leaves the others at zero.
fn reduce_rows(
    comm: &dyn crate::distributed::DeviceCommunicator,
    rows: Vec<Vec<f32>>,
    device: &candle_core::Device,
) -> Result<Vec<Vec<f32>>, ModelError> {
    let n = rows.len();
    let m = rows.first().map_or(0, Vec::len);
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    let t = Tensor::from_vec(flat, (n, m), device)?;
    Ok(comm.all_reduce(&t, ReduceOp::Sum)?.to_vec2::<f32>()?)
}

/// Recall@K in percent for both retrieval directions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RetrievalMetrics {
    pub txt_r1: f64,
    pub txt_r5: f64,
    pub txt_r10: f64,
    pub txt_r_mean: f64,
    pub img_r1: f64,
    pub img_r5: f64,
    pub img_r10: f64,
    pub img_r_mean: f64,
    pub r_mean: f64,
}

impl RetrievalMetrics {
    /// `img2txt[i]` lists the ground-truth texts of image `i`;
    /// `txt2img[t]` is the ground-truth image of text `t`.
    pub fn compute(scores: &SimilarityMatrices, img2txt: &[Vec<usize>], txt2img: &[usize]) -> Self {
        let text_ranks: Vec<usize> = scores
            .i2t
            .iter()
            .zip(img2txt)
            .map(|(row, gts)| {
                let order = top_k(row, row.len());
                gts.iter()
                    .filter_map(|gt| order.iter().position(|j| j == gt))
                    .min()
                    .unwrap_or(usize::MAX)
            })
            .collect();
        let image_ranks: Vec<usize> = scores
            .t2i
            .iter()
            .zip(txt2img)
            .map(|(row, gt)| {
                top_k(row, row.len())
                    .iter()
                    .position(|j| j == gt)
                    .unwrap_or(usize::MAX)
            })
            .collect();

        let recall = |ranks: &[usize], k: usize| {
            if ranks.is_empty() {
                return 0.0;
            }
            100.0 * ranks.iter().filter(|&&r| r < k).count() as f64 / ranks.len() as f64
        };
        let (txt_r1, txt_r5, txt_r10) = (
            recall(&text_ranks, 1),
            recall(&text_ranks, 5),
            recall(&text_ranks, 10),
        );
        let (img_r1, img_r5, img_r10) = (
            recall(&image_ranks, 1),
            recall(&image_ranks, 5),
            recall(&image_ranks, 10),
        );
        let txt_r_mean = (txt_r1 + txt_r5 + txt_r10) / 3.0;
        let img_r_mean = (img_r1 + img_r5 + img_r10) / 3.0;
        Self {
            txt_r1,
            txt_r5,
            txt_r10,
            txt_r_mean,
            img_r1,
            img_r5,
            img_r10,
            img_r_mean,
            r_mean: (txt_r_mean + img_r_mean) / 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::single_rank;
    use crate::testing::{test_tokenizer, tiny_blip2_config};
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};
    use std::sync::Arc;

    #[test]
    fn top_k_orders_descending() {
        assert_eq!(top_k(&[0.1, 0.9, 0.5, 0.7], 2), vec![1, 3]);
        assert_eq!(top_k(&[0.1, 0.9], 5), vec![1, 0]);
    }

    #[test]
    fn fill_row_keeps_only_shortlist() {
        let mut out = vec![0.0; 4];
        fill_row(&mut out, &[0.1, 0.9, 0.5, 0.7], &[1, 3], &[2.0, -1.0]);
        let expected = [-100.0, 2.9, -100.0, -0.3];
        for (got, want) in out.iter().zip(expected) {
            assert!((got - want).abs() < 1e-5, "{out:?}");
        }
    }

    #[test]
    fn metrics_from_perfect_scores() {
        let scores = SimilarityMatrices {
            i2t: vec![vec![1.0, 0.9, 0.0, 0.0], vec![0.0, 0.0, 0.2, 1.0]],
            t2i: vec![
                vec![1.0, 0.0],
                vec![0.9, 0.1],
                vec![0.0, 1.0],
                vec![0.0, 1.0],
            ],
        };
        let img2txt = vec![vec![0, 1], vec![2, 3]];
        let txt2img = vec![0, 0, 1, 1];
        let m = RetrievalMetrics::compute(&scores, &img2txt, &txt2img);
        assert_eq!(m.txt_r1, 100.0);
        assert_eq!(m.img_r1, 100.0);
        assert_eq!(m.r_mean, 100.0);
    }

    #[test]
    fn metrics_count_misses() {
        let scores = SimilarityMatrices {
            i2t: vec![vec![0.0, 1.0], vec![1.0, 0.0]],
            t2i: vec![vec![0.0, 1.0], vec![1.0, 0.0]],
        };
        let m = RetrievalMetrics::compute(&scores, &[vec![0], vec![1]], &[0, 1]);
        assert_eq!(m.txt_r1, 0.0);
        assert_eq!(m.txt_r5, 100.0);
        assert_eq!(m.img_r1, 0.0);
        assert!((m.r_mean - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn sim_matrix_shapes_and_shortlist() {
        let tokenizer = Arc::new(test_tokenizer());
        let cfg = tiny_blip2_config(tokenizer.vocab_size());
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Blip2Mcan::new(&cfg, tokenizer, vb, single_rank()).unwrap();
        model.set_train(false);

        let images = vec![
            Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &Device::Cpu).unwrap(),
            Tensor::randn(0f32, 1.0, (1, 3, 16, 16), &Device::Cpu).unwrap(),
        ];
        let texts: Vec<String> = ["a dog", "two cats", "a red bus", "the man"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let scores = compute_sim_matrix(&model, images, &texts, 2).unwrap();
        assert_eq!(scores.i2t.len(), 3);
        assert_eq!(scores.t2i.len(), 4);
        for row in &scores.i2t {
            assert_eq!(row.len(), 4);
            assert_eq!(row.iter().filter(|&&v| v == UNRANKED).count(), 2);
        }
        for row in &scores.t2i {
            assert_eq!(row.len(), 3);
            assert_eq!(row.iter().filter(|&&v| v == UNRANKED).count(), 1);
        }
    }
}
