//! Annotation file parsing.
//!
//! Every source is reduced to [`VqaRecord`]s: an image path relative to the
//! dataset's image root, a question and its answers. Question-answer sources
//! differ mostly in key names, so one tolerant parser handles them; LLaVA
//! conversations have their own.

use std::path::{Path, PathBuf};

use serde_json::Value;

use super::error::{DatasetError, Result};

/// One question about one image.
#[derive(Debug, Clone, PartialEq)]
pub struct VqaRecord {
    pub image: PathBuf,
    pub question: String,
    pub answers: Vec<String>,
    pub question_id: Option<String>,
}

/// JSON layout of an annotation file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// Question/answer records: a list, `{"data": [...]}`, or a map keyed by
    /// image id. Covers OCR-VQA, TextVQA, COCO-VQA, OK-VQA, A-OKVQA, DocVQA
    /// and ST-VQA.
    QuestionAnswer,
    /// LLaVA instruction data: the first human/gpt turn of each conversation.
    Llava,
}

const IMAGE_KEYS: &[&str] = &["image", "image_path", "file_path", "img_path", "image_name"];
const QUESTION_KEYS: &[&str] = &["question", "questions"];
const ANSWER_KEYS: &[&str] = &["answer", "answers", "direct_answers"];
const QUESTION_ID_KEYS: &[&str] = &["question_id", "questionId", "qid"];

pub fn load_annotations(path: &Path, format: RecordLayout) -> Result<Vec<VqaRecord>> {
    let content = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|source| DatasetError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let bad = |message: String| DatasetError::Annotation {
        path: path.to_path_buf(),
        message,
    };
    match format {
        RecordLayout::QuestionAnswer => parse_question_answer(&value).map_err(bad),
        RecordLayout::Llava => parse_llava(&value).map_err(bad),
    }
}

fn entries(value: &Value) -> std::result::Result<Vec<(Option<&str>, &Value)>, String> {
    match value {
        Value::Array(items) => Ok(items.iter().map(|v| (None, v)).collect()),
        Value::Object(map) => match map.get("data").or_else(|| map.get("annotations")) {
            Some(Value::Array(items)) => Ok(items.iter().map(|v| (None, v)).collect()),
            _ => Ok(map.iter().map(|(k, v)| (Some(k.as_str()), v)).collect()),
        },
        _ => Err("expected a list or an object of records".to_string()),
    }
}

fn first<'a>(record: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| record.get(k))
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                // VQA v2 style: {"answer": "..", "answer_confidence": ..}
                Value::Object(_) => item.get("answer").and_then(as_text),
                other => as_text(other),
            })
            .collect(),
        other => as_text(other).into_iter().collect(),
    }
}

/// Image path from an explicit key, else from `image_id`. Numeric ids use
/// the zero-padded COCO file name.
fn image_path(record: &Value, key: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = first(record, IMAGE_KEYS).and_then(as_text) {
        return Some(PathBuf::from(path));
    }
    match record.get("image_id") {
        Some(Value::Number(n)) => Some(PathBuf::from(format!("{:012}.jpg", n.as_u64()?))),
        Some(Value::String(s)) => Some(PathBuf::from(format!("{s}.jpg"))),
        _ => key.map(|k| PathBuf::from(format!("{k}.jpg"))),
    }
}

fn parse_question_answer(value: &Value) -> std::result::Result<Vec<VqaRecord>, String> {
    let mut records = Vec::new();
    for (i, (key, record)) in entries(value)?.into_iter().enumerate() {
        let image =
            image_path(record, key).ok_or_else(|| format!("record {i} has no image field"))?;
        let question_id = first(record, QUESTION_ID_KEYS).and_then(as_text);
        let questions = first(record, QUESTION_KEYS)
            .ok_or_else(|| format!("record {i} has no question"))?;
        let answers = first(record, ANSWER_KEYS).map(text_list).unwrap_or_default();

        match questions {
            // OCR-VQA: parallel question and answer lists per image
            Value::Array(qs) => {
                for (j, q) in qs.iter().enumerate() {
                    let Some(question) = as_text(q) else {
                        continue;
                    };
                    records.push(VqaRecord {
                        image: image.clone(),
                        question,
                        answers: answers.get(j).cloned().into_iter().collect(),
                        question_id: question_id.clone(),
                    });
                }
            }
            q => {
                let question =
                    as_text(q).ok_or_else(|| format!("record {i} question is not text"))?;
                records.push(VqaRecord {
                    image,
                    question,
                    answers,
                    question_id,
                });
            }
        }
    }
    Ok(records)
}

fn parse_llava(value: &Value) -> std::result::Result<Vec<VqaRecord>, String> {
    let items = value
        .as_array()
        .ok_or_else(|| "expected a list of conversations".to_string())?;
    let mut records = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let image = item
            .get("image")
            .and_then(as_text)
            .ok_or_else(|| format!("conversation {i} has no image"))?;
        let turns = item
            .get("conversations")
            .and_then(Value::as_array)
            .ok_or_else(|| format!("conversation {i} has no turns"))?;
        let turn = |role: &str| {
            turns
                .iter()
                .find(|t| t.get("from").and_then(Value::as_str) == Some(role))
                .and_then(|t| t.get("value"))
                .and_then(as_text)
        };
        let (Some(question), Some(answer)) = (turn("human"), turn("gpt")) else {
            return Err(format!("conversation {i} lacks a human/gpt exchange"));
        };
        records.push(VqaRecord {
            image: PathBuf::from(image),
            question: question.replace("<image>", "").trim().to_string(),
            answers: vec![answer.trim().to_string()],
            question_id: item.get("id").and_then(as_text),
        });
    }
    Ok(records)
}

/// Distinct answers weighted by frequency, in first-seen order.
pub fn answer_weights(answers: &[String]) -> (Vec<String>, Vec<f32>) {
    let mut distinct: Vec<String> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    for answer in answers {
        match distinct.iter().position(|a| a == answer) {
            Some(i) => counts[i] += 1,
            None => {
                distinct.push(answer.clone());
                counts.push(1);
            }
        }
    }
    let total = answers.len().max(1) as f32;
    let weights = counts.iter().map(|&c| c as f32 / total).collect();
    (distinct, weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coco_vqa_list() {
        let v = json!([
            {"question_id": 262148000, "question": "Where is he?", "answer": ["skate park", "park"], "image": "val2014/COCO_val2014_000000262148.jpg"}
        ]);
        let r = parse_question_answer(&v).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(r[0].image, PathBuf::from("val2014/COCO_val2014_000000262148.jpg"));
        assert_eq!(r[0].answers, vec!["skate park", "park"]);
        assert_eq!(r[0].question_id.as_deref(), Some("262148000"));
    }

    #[test]
    fn textvqa_data_wrapper_uses_image_id() {
        let v = json!({"dataset_name": "textvqa", "data": [
            {"image_id": "0054c91397f2fe05", "question": "what brand?", "answers": ["nokia", "nokia", "toshiba"], "question_id": 0}
        ]});
        let r = parse_question_answer(&v).unwrap();
        assert_eq!(r[0].image, PathBuf::from("0054c91397f2fe05.jpg"));
        assert_eq!(r[0].answers.len(), 3);
    }

    #[test]
    fn aokvqa_numeric_image_id_and_direct_answers() {
        let v = json!([{"image_id": 299207, "question": "what is this?", "direct_answers": ["a", "b"], "choices": ["x"], "question_id": "22MexNkBPpdZGX6sxbxVBH"}]);
        let r = parse_question_answer(&v).unwrap();
        assert_eq!(r[0].image, PathBuf::from("000000299207.jpg"));
        assert_eq!(r[0].answers, vec!["a", "b"]);
    }

    #[test]
    fn ocrvqa_map_with_parallel_lists() {
        let v = json!({"1234": {"imageURL": "http://x", "questions": ["Who wrote this book?", "Is this a comic?"], "answers": ["Jane Doe", "No"]}});
        let r = parse_question_answer(&v).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r[0].image, PathBuf::from("1234.jpg"));
        assert_eq!(r[1].question, "Is this a comic?");
        assert_eq!(r[1].answers, vec!["No"]);
    }

    #[test]
    fn stvqa_file_path_and_docvqa_question_id() {
        let v = json!({"data": [
            {"file_path": "coco-text/COCO_train2014_000000000036.jpg", "question": "what is written?", "answers": ["stop"]},
            {"image": "documents/xnbl0037_1.png", "questionId": 52212, "question": "what is the date?", "answers": ["1/8/93"]}
        ]});
        let r = parse_question_answer(&v).unwrap();
        assert_eq!(r[0].image, PathBuf::from("coco-text/COCO_train2014_000000000036.jpg"));
        assert_eq!(r[1].question_id.as_deref(), Some("52212"));
    }

    #[test]
    fn vqa_v2_answer_objects() {
        let v = json!([{"image": "a.jpg", "question": "q", "answers": [{"answer": "yes", "answer_confidence": "yes"}, {"answer": "no"}]}]);
        let r = parse_question_answer(&v).unwrap();
        assert_eq!(r[0].answers, vec!["yes", "no"]);
    }

    #[test]
    fn missing_question_is_error() {
        let v = json!([{"image": "a.jpg", "answer": "x"}]);
        assert!(parse_question_answer(&v).is_err());
    }

    #[test]
    fn llava_first_exchange() {
        let v = json!([{
            "id": "000000033471",
            "image": "000000033471.jpg",
            "conversations": [
                {"from": "human", "value": "<image>\nWhat are the colors of the bus?"},
                {"from": "gpt", "value": "The bus is white and red."},
                {"from": "human", "value": "What feature can be seen?"},
                {"from": "gpt", "value": "A mirror."}
            ]
        }]);
        let r = parse_llava(&v).unwrap();
        assert_eq!(r[0].question, "What are the colors of the bus?");
        assert_eq!(r[0].answers, vec!["The bus is white and red."]);
        assert_eq!(r[0].question_id.as_deref(), Some("000000033471"));
    }

    #[test]
    fn weights_are_count_over_total() {
        let answers: Vec<String> = ["yes", "no", "yes", "yes"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (distinct, weights) = answer_weights(&answers);
        assert_eq!(distinct, vec!["yes", "no"]);
        assert_eq!(weights, vec![0.75, 0.25]);
    }

    #[test]
    fn load_reports_path_on_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_annotations(&path, RecordLayout::QuestionAnswer).unwrap_err();
        assert!(matches!(err, DatasetError::Json { .. }));
    }
}
