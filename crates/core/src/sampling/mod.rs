//! Token selection for caption generation: nucleus sampling and beam search.

pub mod beam;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub use beam::{BeamHypothesis, BeamSearchConfig, BeamSearchState};

/// Parameters controlling token sampling behavior.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    /// Temperature for logit scaling. 0.0 = greedy, higher = more random.
    pub temperature: f32,
    /// Nucleus sampling threshold (0..1). 1.0 = disabled.
    pub top_p: f32,
    /// Top-K filtering. 0 = disabled.
    pub top_k: usize,
    /// Penalty for repeated tokens. 1.0 = none, >1.0 discourages repeats.
    pub repetition_penalty: f32,
    /// Optional seed for deterministic sampling.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn nucleus(top_p: f32, repetition_penalty: f32) -> Self {
        Self {
            top_p,
            repetition_penalty,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < 1e-6
    }
}

/// Mutable sampling state (the RNG).
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

/// Sample a token id from `logits` (length == vocab_size).
///
/// `generated_tokens` feeds the repetition penalty.
pub fn sample(
    logits: &[f32],
    params: &SamplingParams,
    generated_tokens: &[u32],
    state: &mut SamplerState,
) -> u32 {
    let mut logits = logits.to_vec();
    if params.repetition_penalty != 1.0 {
        apply_repetition_penalty(&mut logits, generated_tokens, params.repetition_penalty);
    }
    if params.is_greedy() {
        return argmax(&logits);
    }
    if params.temperature != 1.0 {
        let inv_temp = 1.0 / params.temperature;
        logits.iter_mut().for_each(|l| *l *= inv_temp);
    }

    let mut probs = softmax(&logits);
    if params.top_k > 0 && params.top_k < probs.len() {
        apply_top_k(&mut probs, params.top_k);
    }
    if params.top_p > 0.0 && params.top_p < 1.0 {
        apply_top_p(&mut probs, params.top_p);
    }
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        probs.iter_mut().for_each(|p| *p *= inv_sum);
    }
    sample_from_probs(&probs, &mut state.rng)
}

/// Divide positive logits (multiply negative ones) of already generated tokens.
pub fn apply_repetition_penalty(logits: &mut [f32], generated_tokens: &[u32], penalty: f32) {
    let mut seen = generated_tokens.to_vec();
    seen.sort_unstable();
    seen.dedup();
    for token_id in seen {
        if let Some(logit) = logits.get_mut(token_id as usize) {
            if *logit > 0.0 {
                *logit /= penalty;
            } else {
                *logit *= penalty;
            }
        }
    }
}

fn apply_top_k(probs: &mut [f32], k: usize) {
    let mut sorted: Vec<f32> = probs.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k.min(sorted.len()) - 1];
    for p in probs.iter_mut() {
        if *p < threshold {
            *p = 0.0;
        }
    }
}

/// Keep the smallest set of most likely tokens whose mass exceeds `top_p`.
fn apply_top_p(probs: &mut [f32], top_p: f32) {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0f32;
    let mut cutoff = indexed.len();
    for (i, &(_, p)) in indexed.iter().enumerate() {
        cumsum += p;
        if cumsum > top_p {
            cutoff = i + 1;
            break;
        }
    }
    for &(idx, _) in &indexed[cutoff..] {
        probs[idx] = 0.0;
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        probs.iter_mut().for_each(|p| *p *= inv_sum);
    }
    probs
}

/// Numerically stable log-softmax.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum_ln = logits
        .iter()
        .map(|&x| (x - max_logit).exp())
        .sum::<f32>()
        .ln();
    logits.iter().map(|&x| x - max_logit - exp_sum_ln).collect()
}

fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

fn sample_from_probs(probs: &[f32], rng: &mut StdRng) -> u32 {
    let r: f32 = rng.gen();
    let mut cumsum = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i as u32;
        }
    }
    // rounding left r above the total: take the last token with mass
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .map(|i| i as u32)
        .unwrap_or(0)
}
