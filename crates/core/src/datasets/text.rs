//! Text cleanup applied to questions, answers and captions.

use std::sync::LazyLock;

use regex::Regex;

use super::config::TextProcessorConfig;

static PUNCTUATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[.!"()*#:;~]"#).expect("PUNCTUATION_REGEX pattern is invalid")
});

static SPACES_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("SPACES_REGEX pattern is invalid"));

#[derive(Debug, Clone, PartialEq)]
pub enum TextProcessor {
    /// `blip_question`: lowercase, drop punctuation, cap the word count.
    BlipQuestion { max_words: usize },
    /// `blip_caption`: lowercase, punctuation to spaces, cap the word count,
    /// then prepend the prompt.
    BlipCaption { prompt: String, max_words: usize },
}

impl Default for TextProcessor {
    fn default() -> Self {
        TextProcessor::BlipQuestion { max_words: 50 }
    }
}

impl TextProcessor {
    pub fn from_config(cfg: &TextProcessorConfig) -> Option<Self> {
        match cfg.name.as_str() {
            "blip_question" => Some(Self::BlipQuestion {
                max_words: cfg.max_words,
            }),
            "blip_caption" => Some(Self::BlipCaption {
                prompt: cfg.prompt.clone(),
                max_words: cfg.max_words,
            }),
            _ => None,
        }
    }

    pub fn process(&self, text: &str) -> String {
        match self {
            Self::BlipQuestion { max_words } => {
                let lower = text.to_lowercase();
                let cleaned = PUNCTUATION_REGEX.replace_all(&lower, "");
                truncate_words(&SPACES_REGEX.replace_all(&cleaned, " "), *max_words)
            }
            Self::BlipCaption { prompt, max_words } => {
                let lower = text.to_lowercase();
                let cleaned = PUNCTUATION_REGEX.replace_all(&lower, " ");
                let caption = truncate_words(&SPACES_REGEX.replace_all(&cleaned, " "), *max_words);
                format!("{prompt}{caption}")
            }
        }
    }
}

fn truncate_words(text: &str, max_words: usize) -> String {
    let text = text.trim_end_matches('\n').trim_matches(' ');
    let words: Vec<&str> = text.split(' ').collect();
    if words.len() > max_words {
        words[..max_words].join(" ")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_strips_punctuation() {
        let p = TextProcessor::BlipQuestion { max_words: 50 };
        assert_eq!(
            p.process("What is the (man) holding?  Answer: \"A bat\"."),
            "what is the man holding? answer a bat"
        );
    }

    #[test]
    fn question_truncates_words() {
        let p = TextProcessor::BlipQuestion { max_words: 3 };
        assert_eq!(p.process("one two three four five"), "one two three");
    }

    #[test]
    fn caption_prepends_prompt() {
        let p = TextProcessor::BlipCaption {
            prompt: "a picture of ".to_string(),
            max_words: 50,
        };
        assert_eq!(p.process("A Dog; running."), "a picture of a dog running");
    }

    #[test]
    fn from_config_by_name() {
        let cfg = TextProcessorConfig {
            name: "blip_caption".to_string(),
            prompt: "q: ".to_string(),
            max_words: 10,
        };
        assert_eq!(
            TextProcessor::from_config(&cfg),
            Some(TextProcessor::BlipCaption {
                prompt: "q: ".to_string(),
                max_words: 10
            })
        );
        let cfg = TextProcessorConfig {
            name: "gpt_prompt".to_string(),
            ..cfg
        };
        assert!(TextProcessor::from_config(&cfg).is_none());
    }
}
