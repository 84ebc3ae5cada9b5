//! Judge verdicts and the parse boundary that produces them.
//!
//! The judge answers with loosely structured text. Everything that reaches
//! the rest of the harness goes through [`parse_verdict`], which either
//! yields a [`JudgeVerdict`] with a validated [`Score`] or says exactly why
//! it could not.

use crate::error::VerdictParseError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Keys the score may appear under, in order of preference.
const SCORE_KEYS: &[&str] = &["score", "retrieval", "gpt_retrieval", "relevance"];

/// Keys the rationale may appear under, in order of preference.
const RATIONALE_KEYS: &[&str] = &["rationale", "reason", "explanation", "retrieval_reason"];

/// Relevance on the ordinal scale 1 (irrelevant) to 5 (highly relevant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Score(u8);

impl Score {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(value: u8) -> Result<Self, VerdictParseError> {
        Self::from_number(f64::from(value))
    }

    /// Validate a number read from the judge. Never clamps.
    pub fn from_number(value: f64) -> Result<Self, VerdictParseError> {
        if !value.is_finite() {
            return Err(VerdictParseError::NonNumericScore(value.to_string()));
        }
        if value < f64::from(Self::MIN) || value > f64::from(Self::MAX) {
            return Err(VerdictParseError::ScoreOutOfRange(value));
        }
        if value.fract() != 0.0 {
            return Err(VerdictParseError::NonIntegralScore(value));
        }
        Ok(Self(value as u8))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Score {
    type Error = VerdictParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Score> for u8 {
    fn from(score: Score) -> Self {
        score.0
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The judge's rating of one (query, context) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub score: Score,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl JudgeVerdict {
    pub fn new(score: Score, rationale: Option<String>) -> Self {
        Self { score, rationale }
    }
}

/// Parse a judge completion into a verdict.
pub fn parse_verdict(response: &str) -> Result<JudgeVerdict, VerdictParseError> {
    let value: Value = serde_json::from_str(extract_json(response))
        .map_err(|e| VerdictParseError::NotJson(format!("{}. Response: {}", e, response.trim())))?;

    let object = match value {
        Value::Object(object) => object,
        other => {
            return Err(VerdictParseError::NotJson(format!(
                "expected an object, got {}",
                other
            )));
        }
    };

    let score = Score::from_number(score_number(&object)?)?;

    let rationale = RATIONALE_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    Ok(JudgeVerdict { score, rationale })
}

fn score_number(object: &Map<String, Value>) -> Result<f64, VerdictParseError> {
    let raw = SCORE_KEYS
        .iter()
        .find_map(|key| object.get(*key).filter(|v| !v.is_null()))
        .ok_or(VerdictParseError::MissingScore)?;

    match raw {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| VerdictParseError::NonNumericScore(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| VerdictParseError::NonNumericScore(s.clone())),
        other => Err(VerdictParseError::NonNumericScore(other.to_string())),
    }
}

/// Extract the JSON payload from a completion that may wrap it in prose or fences.
fn extract_json(response: &str) -> &str {
    let response = response.trim();

    if let Some(fenced) = response.strip_prefix("```") {
        let body = fenced.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
        if let Some(end) = body.rfind("```") {
            return body[..end].trim();
        }
    }

    if let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) {
        if end > start {
            return &response[start..=end];
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let verdict =
            parse_verdict(r#"{"score": 4, "rationale": "Covers the question well"}"#).unwrap();
        assert_eq!(verdict.score.value(), 4);
        assert_eq!(verdict.rationale.as_deref(), Some("Covers the question well"));
    }

    #[test]
    fn test_parse_fenced_json_with_alternate_keys() {
        let response = "```json\n{\"gpt_retrieval\": 2.0, \"retrieval_reason\": \"Thin\"}\n```";
        let verdict = parse_verdict(response).unwrap();
        assert_eq!(verdict.score.value(), 2);
        assert_eq!(verdict.rationale.as_deref(), Some("Thin"));
    }

    #[test]
    fn test_parse_json_surrounded_by_prose() {
        let response = "Here is my verdict: {\"score\": \"5\"} Hope that helps.";
        let verdict = parse_verdict(response).unwrap();
        assert_eq!(verdict.score.value(), 5);
        assert!(verdict.rationale.is_none());
    }

    #[test]
    fn test_out_of_range_is_rejected_not_clamped() {
        assert_eq!(
            parse_verdict(r#"{"score": 7}"#),
            Err(VerdictParseError::ScoreOutOfRange(7.0))
        );
        assert_eq!(
            parse_verdict(r#"{"score": 0}"#),
            Err(VerdictParseError::ScoreOutOfRange(0.0))
        );
        assert_eq!(
            parse_verdict(r#"{"score": -3}"#),
            Err(VerdictParseError::ScoreOutOfRange(-3.0))
        );
    }

    #[test]
    fn test_non_numeric_and_fractional_scores() {
        assert_eq!(
            parse_verdict(r#"{"score": "high"}"#),
            Err(VerdictParseError::NonNumericScore("high".to_string()))
        );
        assert!(matches!(
            parse_verdict(r#"{"score": [4]}"#),
            Err(VerdictParseError::NonNumericScore(_))
        ));
        assert!(matches!(
            parse_verdict(r#"{"score": "NaN"}"#),
            Err(VerdictParseError::NonNumericScore(_))
        ));
        assert_eq!(
            parse_verdict(r#"{"score": 3.5}"#),
            Err(VerdictParseError::NonIntegralScore(3.5))
        );
    }

    #[test]
    fn test_missing_score_and_non_json() {
        assert_eq!(
            parse_verdict(r#"{"rationale": "no number"}"#),
            Err(VerdictParseError::MissingScore)
        );
        assert_eq!(
            parse_verdict(r#"{"score": null}"#),
            Err(VerdictParseError::MissingScore)
        );
        assert!(matches!(
            parse_verdict("I would rate this a four."),
            Err(VerdictParseError::NotJson(_))
        ));
        assert!(matches!(
            parse_verdict("[4]"),
            Err(VerdictParseError::NotJson(_))
        ));
    }

    #[test]
    fn test_score_bounds() {
        for value in Score::MIN..=Score::MAX {
            assert_eq!(Score::new(value).unwrap().value(), value);
        }
        assert!(Score::new(0).is_err());
        assert!(Score::new(6).is_err());
    }

    #[test]
    fn test_score_deserialization_validates() {
        let verdict: JudgeVerdict = serde_json::from_str(r#"{"score": 3}"#).unwrap();
        assert_eq!(verdict.score.value(), 3);
        assert!(serde_json::from_str::<JudgeVerdict>(r#"{"score": 9}"#).is_err());
    }
}
