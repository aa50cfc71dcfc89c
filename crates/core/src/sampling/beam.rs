//! Beam search decoding.
//!
//! Keeps `beam_width` live hypotheses ranked by cumulative log probability
//! and collects hypotheses that emit EOS.

use std::cmp::Ordering;

/// Configuration for beam search decoding.
#[derive(Debug, Clone)]
pub struct BeamSearchConfig {
    pub beam_width: usize,
    /// Exponent on the length when normalizing scores (0 = none).
    pub length_penalty: f32,
    /// Stop once `beam_width` hypotheses are complete.
    pub early_stopping: bool,
}

impl Default for BeamSearchConfig {
    fn default() -> Self {
        Self {
            beam_width: 3,
            length_penalty: 1.0,
            early_stopping: false,
        }
    }
}

/// A single beam hypothesis.
#[derive(Debug, Clone)]
pub struct BeamHypothesis {
    /// Generated tokens (not including the start token).
    pub token_ids: Vec<u32>,
    /// Cumulative log probability.
    pub score: f32,
}

impl BeamHypothesis {
    fn root() -> Self {
        Self {
            token_ids: Vec::new(),
            score: 0.0,
        }
    }

    /// `score / len^length_penalty`
    pub fn normalized_score(&self, length_penalty: f32) -> f32 {
        if length_penalty == 0.0 || self.token_ids.is_empty() {
            self.score
        } else {
            self.score / (self.token_ids.len() as f32).powf(length_penalty)
        }
    }
}

/// Beam search state tracker.
#[derive(Debug)]
pub struct BeamSearchState {
    pub config: BeamSearchConfig,
    /// Live hypotheses; all have the same length.
    pub beams: Vec<BeamHypothesis>,
    /// Hypotheses that emitted EOS.
    pub completed: Vec<BeamHypothesis>,
    eos_token_id: u32,
}

impl BeamSearchState {
    /// Start from a single empty hypothesis so the first step does not
    /// expand `beam_width` identical copies.
    pub fn new(config: BeamSearchConfig, eos_token_id: u32) -> Self {
        Self {
            config,
            beams: vec![BeamHypothesis::root()],
            completed: Vec::new(),
            eos_token_id,
        }
    }

    pub fn num_active_beams(&self) -> usize {
        self.beams.len()
    }

    fn worst_completed(&self) -> f32 {
        self.completed
            .iter()
            .map(|h| h.normalized_score(self.config.length_penalty))
            .fold(f32::INFINITY, f32::min)
    }

    /// No live beam can still produce a better result.
    pub fn is_done(&self) -> bool {
        if self.beams.is_empty() {
            return true;
        }
        if self.completed.len() < self.config.beam_width {
            return false;
        }
        if self.config.early_stopping {
            return true;
        }
        let best_active = self
            .beams
            .iter()
            .map(|b| b.normalized_score(self.config.length_penalty))
            .fold(f32::NEG_INFINITY, f32::max);
        best_active <= self.worst_completed()
    }

    /// Expand every live beam with `log_probs[beam][token]` and keep the best
    /// `beam_width` continuations. EOS continuations go to `completed`.
    ///
    /// Returns, for each new live beam, `(parent_beam_idx, token_id)`.
    pub fn step(&mut self, log_probs: &[Vec<f32>]) -> Vec<(usize, u32)> {
        let mut candidates: Vec<(f32, usize, u32)> = Vec::new();
        for (beam_idx, beam) in self.beams.iter().enumerate() {
            let Some(row) = log_probs.get(beam_idx) else {
                continue;
            };
            for (token_id, &lp) in row.iter().enumerate() {
                if lp.is_finite() {
                    candidates.push((beam.score + lp, beam_idx, token_id as u32));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let width = self.config.beam_width;
        let mut new_beams = Vec::with_capacity(width);
        let mut transitions = Vec::with_capacity(width);
        for (rank, (score, beam_idx, token_id)) in candidates.into_iter().enumerate() {
            if new_beams.len() == width {
                break;
            }
            let mut token_ids = self.beams[beam_idx].token_ids.clone();
            token_ids.push(token_id);
            let hyp = BeamHypothesis { token_ids, score };
            if token_id == self.eos_token_id {
                // only EOS among the top `width` candidates may finish
                if rank < width {
                    self.completed.push(hyp);
                }
            } else {
                transitions.push((beam_idx, token_id));
                new_beams.push(hyp);
            }
        }

        self.beams = new_beams;
        transitions
    }

    /// Best hypothesis by normalized score, completed ones first considered.
    /// Falls back to live beams when nothing emitted EOS.
    pub fn best(&self) -> Option<&BeamHypothesis> {
        let lp = self.config.length_penalty;
        let pool: Vec<&BeamHypothesis> = if self.completed.is_empty() {
            self.beams.iter().collect()
        } else {
            self.completed.iter().collect()
        };
        pool.into_iter().max_by(|a, b| {
            a.normalized_score(lp)
                .partial_cmp(&b.normalized_score(lp))
                .unwrap_or(Ordering::Equal)
        })
    }
}
