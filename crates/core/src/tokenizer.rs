//! BERT word-piece tokenizer with the `[DEC]` decoder start token.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use candle_core::{Device, Tensor};
use tokenizers::processors::bert::BertProcessing;
use tokenizers::{
    AddedToken, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams,
};

pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";
pub const CLS_TOKEN: &str = "[CLS]";
pub const SEP_TOKEN: &str = "[SEP]";
pub const BOS_TOKEN: &str = "[DEC]";

/// Padded batch of token ids.
#[derive(Debug, Clone)]
pub struct TextTokens {
    /// `[B, T]` u32
    pub input_ids: Tensor,
    /// `[B, T]` u32, `1` for real tokens
    pub attention_mask: Tensor,
}

impl TextTokens {
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.dims().get(1).copied().unwrap_or(0)
    }
}

/// Batch encoders keyed by `(max_len, pad_to_max_len)`.
type EncoderCache = Mutex<HashMap<(usize, bool), Arc<Tokenizer>>>;

pub struct BlipTokenizer {
    inner: Tokenizer,
    encoders: EncoderCache,
    pad_token_id: u32,
    cls_token_id: u32,
    sep_token_id: u32,
    bos_token_id: u32,
}

impl BlipTokenizer {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let inner =
            Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("tokenizer load: {e}"))?;
        Self::from_tokenizer(inner)
    }

    /// Fetch `tokenizer.json` for `model_id` from the HuggingFace Hub (or cache).
    pub fn from_pretrained(model_id: &str) -> anyhow::Result<Self> {
        let api = hf_hub::api::sync::Api::new()?;
        let path = api.model(model_id.to_string()).get("tokenizer.json")?;
        Self::from_file(&path)
    }

    /// Wrap a tokenizer, registering `[DEC]` as an added special token.
    ///
    /// Tokenizers without a post-processor get BERT's `[CLS] .. [SEP]`
    /// template. Truncation and padding stored in the file are cleared;
    /// batch encoding configures its own.
    pub fn from_tokenizer(mut inner: Tokenizer) -> anyhow::Result<Self> {
        inner.add_special_tokens(&[AddedToken::from(BOS_TOKEN, true)]);
        let id = |token: &str| {
            inner
                .token_to_id(token)
                .ok_or_else(|| anyhow::anyhow!("tokenizer has no {token} token"))
        };
        let pad_token_id = id(PAD_TOKEN)?;
        let cls_token_id = id(CLS_TOKEN)?;
        let sep_token_id = id(SEP_TOKEN)?;
        let bos_token_id = id(BOS_TOKEN)?;
        if inner.get_post_processor().is_none() {
            inner.with_post_processor(Some(BertProcessing::new(
                (SEP_TOKEN.to_string(), sep_token_id),
                (CLS_TOKEN.to_string(), cls_token_id),
            )));
        }
        inner
            .with_truncation(None)
            .map_err(|e| anyhow::anyhow!("tokenizer truncation: {e}"))?;
        inner.with_padding(None);
        Ok(Self {
            inner,
            encoders: Mutex::new(HashMap::new()),
            pad_token_id,
            cls_token_id,
            sep_token_id,
            bos_token_id,
        })
    }

    /// Word-level tokenizer over `words`, with the special tokens at ids 0..5.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(words: &[&str]) -> Self {
        use tokenizers::models::wordlevel::WordLevel;
        use tokenizers::pre_tokenizers::whitespace::Whitespace;

        let specials = [PAD_TOKEN, UNK_TOKEN, CLS_TOKEN, SEP_TOKEN, BOS_TOKEN];
        let mut vocab = ahash::AHashMap::new();
        for (i, tok) in specials.iter().chain(words.iter()).enumerate() {
            vocab.entry(tok.to_string()).or_insert(i as u32);
        }
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token(UNK_TOKEN.into())
            .build()
            .expect("build test tokenizer model");
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        let added: Vec<AddedToken> = specials
            .iter()
            .map(|t| AddedToken::from(*t, true))
            .collect();
        tokenizer.add_special_tokens(&added);
        Self::from_tokenizer(tokenizer).expect("test tokenizer has special tokens")
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    pub fn cls_token_id(&self) -> u32 {
        self.cls_token_id
    }

    /// End-of-sequence id used by generation.
    pub fn sep_token_id(&self) -> u32 {
        self.sep_token_id
    }

    pub fn bos_token_id(&self) -> u32 {
        self.bos_token_id
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Ids of `text` without special tokens.
    pub fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("encode: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Tokenize, truncate to `max_len` and pad to the longest sequence.
    pub fn encode_batch<S: AsRef<str>>(
        &self,
        texts: &[S],
        max_len: usize,
        device: &Device,
    ) -> anyhow::Result<TextTokens> {
        self.encode_padded(texts, max_len, false, device)
    }

    /// Tokenize, truncate and pad every row to exactly `max_len`, so batches
    /// from different ranks share one shape.
    pub fn encode_batch_fixed<S: AsRef<str>>(
        &self,
        texts: &[S],
        max_len: usize,
        device: &Device,
    ) -> anyhow::Result<TextTokens> {
        self.encode_padded(texts, max_len, true, device)
    }

    /// Copy of the tokenizer that truncates to `max_len` (special tokens
    /// included) and pads either to the longest row or to `max_len`.
    fn batch_encoder(&self, max_len: usize, pad_to_max: bool) -> anyhow::Result<Arc<Tokenizer>> {
        let max_len = max_len.max(2);
        let mut encoders = self
            .encoders
            .lock()
            .map_err(|_| anyhow::anyhow!("tokenizer cache poisoned"))?;
        if let Some(encoder) = encoders.get(&(max_len, pad_to_max)) {
            return Ok(Arc::clone(encoder));
        }
        let mut encoder = self.inner.clone();
        encoder
            .with_truncation(Some(TruncationParams {
                max_length: max_len,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("tokenizer truncation: {e}"))?;
        encoder.with_padding(Some(PaddingParams {
            strategy: if pad_to_max {
                PaddingStrategy::Fixed(max_len)
            } else {
                PaddingStrategy::BatchLongest
            },
            pad_id: self.pad_token_id,
            pad_token: PAD_TOKEN.to_string(),
            ..Default::default()
        }));
        let encoder = Arc::new(encoder);
        encoders.insert((max_len, pad_to_max), Arc::clone(&encoder));
        Ok(encoder)
    }

    fn encode_padded<S: AsRef<str>>(
        &self,
        texts: &[S],
        max_len: usize,
        pad_to_max: bool,
        device: &Device,
    ) -> anyhow::Result<TextTokens> {
        let encoder = self.batch_encoder(max_len, pad_to_max)?;
        let inputs: Vec<&str> = texts.iter().map(AsRef::as_ref).collect();
        let encodings = encoder
            .encode_batch(inputs, true)
            .map_err(|e| anyhow::anyhow!("encode: {e}"))?;
        let seq_len = encodings.first().map_or(2, |e| e.len());
        let mut ids = Vec::with_capacity(encodings.len() * seq_len);
        let mut mask = Vec::with_capacity(encodings.len() * seq_len);
        for encoding in &encodings {
            ids.extend_from_slice(encoding.get_ids());
            mask.extend_from_slice(encoding.get_attention_mask());
        }
        let shape = (encodings.len(), seq_len);
        Ok(TextTokens {
            input_ids: Tensor::from_vec(ids, shape, device)?,
            attention_mask: Tensor::from_vec(mask, shape, device)?,
        })
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> anyhow::Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("decode: {e}"))
    }

    pub fn batch_decode(
        &self,
        sequences: &[Vec<u32>],
        skip_special_tokens: bool,
    ) -> anyhow::Result<Vec<String>> {
        sequences
            .iter()
            .map(|ids| self.decode(ids, skip_special_tokens))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> BlipTokenizer {
        BlipTokenizer::for_testing(&["a", "cat", "on", "the", "mat", "dog"])
    }

    #[test]
    fn special_token_ids() {
        let tok = tokenizer();
        assert_eq!(tok.pad_token_id(), 0);
        assert_eq!(tok.cls_token_id(), 2);
        assert_eq!(tok.sep_token_id(), 3);
        assert_eq!(tok.bos_token_id(), 4);
        assert_eq!(tok.vocab_size(), 11);
    }

    #[test]
    fn encode_batch_pads_to_longest() {
        let tok = tokenizer();
        let batch = tok
            .encode_batch(&["a cat on the mat", "dog"], 32, &Device::Cpu)
            .unwrap();
        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.seq_len(), 7);
        let ids = batch.input_ids.to_vec2::<u32>().unwrap();
        assert_eq!(ids[0], vec![2, 5, 6, 7, 8, 9, 3]);
        assert_eq!(ids[1], vec![2, 10, 3, 0, 0, 0, 0]);
        let mask = batch.attention_mask.to_vec2::<u32>().unwrap();
        assert_eq!(mask[1], vec![1, 1, 1, 0, 0, 0, 0]);
    }

    #[test]
    fn encode_batch_truncates() {
        let tok = tokenizer();
        let batch = tok
            .encode_batch(&["a cat on the mat"], 4, &Device::Cpu)
            .unwrap();
        let ids = batch.input_ids.to_vec2::<u32>().unwrap();
        assert_eq!(ids[0], vec![2, 5, 6, 3]);
    }

    #[test]
    fn encode_batch_fixed_pads_to_max_len() {
        let tok = tokenizer();
        let batch = tok.encode_batch_fixed(&["dog"], 6, &Device::Cpu).unwrap();
        assert_eq!(
            batch.input_ids.to_vec2::<u32>().unwrap(),
            vec![vec![2, 10, 3, 0, 0, 0]]
        );
    }

    #[test]
    fn fixed_and_longest_encoders_are_cached_separately() {
        let tok = tokenizer();
        let longest = tok.encode_batch(&["dog"], 6, &Device::Cpu).unwrap();
        let fixed = tok.encode_batch_fixed(&["dog"], 6, &Device::Cpu).unwrap();
        let again = tok.encode_batch(&["dog", "a cat"], 6, &Device::Cpu).unwrap();
        assert_eq!(longest.seq_len(), 3);
        assert_eq!(fixed.seq_len(), 6);
        assert_eq!(
            fixed.attention_mask.to_vec2::<u32>().unwrap(),
            vec![vec![1, 1, 1, 0, 0, 0]]
        );
        assert_eq!(
            again.input_ids.to_vec2::<u32>().unwrap(),
            vec![vec![2, 10, 3, 0], vec![2, 5, 6, 3]]
        );
    }

    #[test]
    fn plain_encode_has_no_special_tokens() {
        let tok = tokenizer();
        assert_eq!(tok.encode("a cat").unwrap(), vec![5, 6]);
    }

    #[test]
    fn decode_skips_special_tokens() {
        let tok = tokenizer();
        let text = tok.decode(&[4, 5, 6, 3, 0], true).unwrap();
        assert_eq!(text, "a cat");
        let all = tok.batch_decode(&[vec![2, 10, 3]], true).unwrap();
        assert_eq!(all, vec!["dog".to_string()]);
    }

    #[test]
    #[ignore] // requires network access
    fn bert_tokenizer_from_hub() {
        let tok = BlipTokenizer::from_pretrained("bert-base-uncased").unwrap();
        assert_eq!(tok.vocab_size(), 30523);
        assert_eq!(tok.bos_token_id(), 30522);
    }
}
