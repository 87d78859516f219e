//! Canonical answer sets and content digests.
//!
//! Equal semantic content must hash equally no matter how the source system
//! ordered keys, padded strings or listed multi-select options.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::Answers;

pub const DIGEST_PREFIX: &str = "sha256:";

/// Answered `(question_code, normalized_value)` pairs of one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerSet {
    pairs: BTreeMap<String, Value>,
}

impl AnswerSet {
    /// Extract the answered entries of `answers`.
    ///
    /// Blank question codes and unanswered values (null, blank strings, empty
    /// arrays or objects) are dropped.
    #[must_use]
    pub fn from_answers(answers: &Answers) -> Self {
        let mut pairs = BTreeMap::new();
        for (code, value) in answers {
            let code = code.trim();
            if code.is_empty() {
                continue;
            }
            if let Some(normalized) = normalize_value(value) {
                pairs.insert(code.to_string(), normalized);
            }
        }
        Self { pairs }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.pairs.keys().map(String::as_str)
    }

    /// True when every pair of `other` is present here and this set has more.
    #[must_use]
    pub fn is_strict_superset_of(&self, other: &Self) -> bool {
        self.pairs.len() > other.pairs.len()
            && other.pairs.iter().all(|(code, value)| self.pairs.get(code) == Some(value))
    }

    /// `sha256:<hex>` over the canonical JSON object of this set.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut object = Map::new();
        for (code, value) in &self.pairs {
            object.insert(code.clone(), value.clone());
        }
        let canonical = Value::Object(object).to_string();

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{DIGEST_PREFIX}{}", hex::encode(hasher.finalize()))
    }
}

/// Content digest of a raw answer mapping.
#[must_use]
pub fn content_digest(answers: &Answers) -> String {
    AnswerSet::from_answers(answers).digest()
}

#[must_use]
pub fn is_well_formed_digest(value: &str) -> bool {
    value
        .strip_prefix(DIGEST_PREFIX)
        .is_some_and(|hex_part| hex_part.len() == 64 && hex::decode(hex_part).is_ok())
}

fn normalize_value(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(value.clone()),
        Value::Number(number) => Some(normalize_number(number)),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(Value::String(trimmed.to_string()))
            }
        }
        Value::Array(items) => {
            // Selections are unordered: keyed by canonical encoding to sort and de-duplicate.
            let mut keyed = BTreeMap::new();
            for item in items {
                if let Some(normalized) = normalize_value(item) {
                    keyed.insert(normalized.to_string(), normalized);
                }
            }
            if keyed.is_empty() {
                None
            } else {
                Some(Value::Array(keyed.into_values().collect()))
            }
        }
        Value::Object(fields) => {
            let sorted = fields
                .iter()
                .filter_map(|(key, child)| normalize_value(child).map(|child| (key, child)))
                .collect::<BTreeMap<_, _>>();
            if sorted.is_empty() {
                return None;
            }
            let mut object = Map::new();
            for (key, child) in sorted {
                object.insert(key.clone(), child);
            }
            Some(Value::Object(object))
        }
    }
}

/// Integral floats collapse onto the integer encoding so `70.0` equals `70`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn normalize_number(number: &Number) -> Value {
    if !number.is_f64() {
        return Value::Number(number.clone());
    }
    match number.as_f64() {
        Some(float) if float.is_finite() && float.fract() == 0.0 => {
            if (0.0..u64::MAX as f64).contains(&float) {
                Value::from(float as u64)
            } else if (i64::MIN as f64..0.0).contains(&float) {
                Value::from(float as i64)
            } else {
                Value::Number(number.clone())
            }
        }
        _ => Value::Number(number.clone()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn answers(value: Value) -> Answers {
        match serde_json::from_value(value) {
            Ok(answers) => answers,
            Err(err) => panic!("fixture answers should deserialize: {err}"),
        }
    }

    #[test]
    fn digest_ignores_key_order_and_whitespace() {
        let left = answers(json!({"basics": " A ", "extra": {"y": 2, "x": 1}}));
        let right = answers(json!({"extra": {"x": 1, "y": 2}, "basics": "A"}));

        assert_eq!(content_digest(&left), content_digest(&right));
    }

    #[test]
    fn digest_treats_multi_select_as_unordered() {
        let left = answers(json!({"symptoms": ["fatigue", "cough", "cough"]}));
        let right = answers(json!({"symptoms": ["cough", "fatigue"]}));

        assert_eq!(content_digest(&left), content_digest(&right));
    }

    #[test]
    fn unanswered_values_do_not_contribute() {
        let sparse = answers(json!({"a": null, "b": "", "c": [], "d": {}}));

        assert!(AnswerSet::from_answers(&sparse).is_empty());
        assert_eq!(content_digest(&sparse), content_digest(&Answers::new()));
    }

    #[test]
    fn distinct_values_produce_distinct_digests() {
        let left = answers(json!({"basics": "A"}));
        let right = answers(json!({"basics": "B"}));

        assert_ne!(content_digest(&left), content_digest(&right));
    }

    #[test]
    fn digest_is_prefixed_hex() {
        let digest = content_digest(&answers(json!({"basics": "A"})));

        assert!(is_well_formed_digest(&digest), "unexpected digest format: {digest}");
        assert!(!is_well_formed_digest("md5:deadbeef"));
        assert!(!is_well_formed_digest(""));
    }

    #[test]
    fn integral_floats_hash_like_integers() {
        let integer = answers(json!({"weight_kg": 70, "delta": -3}));
        let float = answers(json!({"weight_kg": 70.0, "delta": -3.0}));
        let fractional = answers(json!({"weight_kg": 70.5, "delta": -3}));

        assert_eq!(content_digest(&integer), content_digest(&float));
        assert_ne!(content_digest(&integer), content_digest(&fractional));
    }

    #[test]
    fn superset_matches_across_number_encodings() {
        let small = AnswerSet::from_answers(&answers(json!({"weight_kg": 70})));
        let large = AnswerSet::from_answers(&answers(json!({"weight_kg": 70.0, "extra": "B"})));

        assert!(large.is_strict_superset_of(&small));
    }

    #[test]
    fn strict_superset_requires_equal_shared_values() {
        let small = AnswerSet::from_answers(&answers(json!({"a": 1})));
        let large = AnswerSet::from_answers(&answers(json!({"a": 1, "b": 2})));
        let changed = AnswerSet::from_answers(&answers(json!({"a": 9, "b": 2})));

        assert!(large.is_strict_superset_of(&small));
        assert!(!small.is_strict_superset_of(&large));
        assert!(!large.is_strict_superset_of(&large.clone()));
        assert!(!changed.is_strict_superset_of(&small));
    }
}
