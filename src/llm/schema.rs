//! Typed output records for each pipeline phase.
//!
//! Each phase declares its own record (never one union across phases) with
//! a JSON schema sent to the provider and a normalization pass applied to
//! the raw response: numeric strings are coerced, probabilities clamped to
//! [0,1], NaN/Inf rejected. Validation failures carry a human-readable
//! message that gets appended to the retry prompt.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A structured output record one worker produces.
pub trait PhaseOutput: Sized + Send + DeserializeOwned + Serialize {
    fn schema_name() -> &'static str;

    /// JSON schema forwarded to the provider's structured-output mode.
    fn json_schema() -> Value;

    /// In-place fix-ups on the raw value before deserialization.
    fn normalize(value: &mut Value) -> Result<(), String> {
        let _ = value;
        Ok(())
    }

    /// Semantic checks after deserialization.
    fn check(&self) -> Result<(), String> {
        Ok(())
    }

    /// Parse, normalize and validate a raw model response.
    fn from_raw(raw: &str) -> Result<Self, String> {
        let stripped = strip_code_fences(raw);
        let mut value: Value = serde_json::from_str(stripped.trim())
            .map_err(|e| format!("response is not valid JSON: {e}"))?;
        Self::normalize(&mut value)?;
        let parsed: Self = serde_json::from_value(value)
            .map_err(|e| format!("response does not match the {} schema: {e}", Self::schema_name()))?;
        parsed.check()?;
        Ok(parsed)
    }
}

/// Models wrap JSON in markdown fences often enough to handle it here.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Coerce a value into a finite f64, accepting numeric strings.
fn as_finite_f64(value: &Value) -> Result<f64, String> {
    let n = match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| "number out of range".to_string())?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("expected a number, got \"{s}\""))?,
        other => return Err(format!("expected a number, got {other}")),
    };
    if !n.is_finite() {
        return Err("number must be finite (NaN/Inf rejected)".to_string());
    }
    Ok(n)
}

/// Replace `obj[key]` with a finite number clamped to `[lo, hi]`.
fn normalize_number_field(obj: &mut Value, key: &str, lo: f64, hi: f64) -> Result<(), String> {
    let Some(map) = obj.as_object_mut() else {
        return Err("expected a JSON object".to_string());
    };
    let Some(raw) = map.get(key) else {
        return Err(format!("missing required field \"{key}\""));
    };
    let n = as_finite_f64(raw).map_err(|e| format!("field \"{key}\": {e}"))?;
    let clamped = n.clamp(lo, hi);
    map.insert(
        key.to_string(),
        Value::Number(
            serde_json::Number::from_f64(clamped).ok_or_else(|| "number out of range".to_string())?,
        ),
    );
    Ok(())
}

fn require_array<'a>(value: &'a mut Value, key: &str) -> Result<&'a mut Vec<Value>, String> {
    value
        .get_mut(key)
        .and_then(|v| v.as_array_mut())
        .ok_or_else(|| format!("missing required array \"{key}\""))
}

// ---------------------------------------------------------------------------
// Phase 1: discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorCandidate {
    pub name: String,
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    "general".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryOutput {
    pub factors: Vec<FactorCandidate>,
}

impl PhaseOutput for DiscoveryOutput {
    fn schema_name() -> &'static str {
        "discovery_factors"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "factors": {
                    "type": "array",
                    "maxItems": 5,
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "description": {"type": "string"},
                            "category": {"type": "string"}
                        },
                        "required": ["name", "description", "category"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["factors"],
            "additionalProperties": false
        })
    }

    fn normalize(value: &mut Value) -> Result<(), String> {
        let items = require_array(value, "factors")?;
        items.retain(|f| {
            f.get("name")
                .and_then(|n| n.as_str())
                .is_some_and(|n| !n.trim().is_empty())
        });
        // Each discovery worker contributes at most 5 candidates.
        items.truncate(5);
        Ok(())
    }

    fn check(&self) -> Result<(), String> {
        if self.factors.is_empty() {
            return Err("at least one factor is required".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Phase 2: validation (dedup / merge)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutput {
    pub factors: Vec<FactorCandidate>,
}

impl PhaseOutput for ValidationOutput {
    fn schema_name() -> &'static str {
        "validated_factors"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "factors": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "description": {"type": "string"},
                            "category": {"type": "string"}
                        },
                        "required": ["name", "description", "category"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["factors"],
            "additionalProperties": false
        })
    }

    fn normalize(value: &mut Value) -> Result<(), String> {
        let items = require_array(value, "factors")?;
        items.retain(|f| {
            f.get("name")
                .and_then(|n| n.as_str())
                .is_some_and(|n| !n.trim().is_empty())
        });
        Ok(())
    }

    fn check(&self) -> Result<(), String> {
        if self.factors.is_empty() {
            return Err("validation must keep at least one factor".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Phase 2: rating consensus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorRating {
    pub name: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingOutput {
    pub ratings: Vec<FactorRating>,
}

impl PhaseOutput for RatingOutput {
    fn schema_name() -> &'static str {
        "factor_ratings"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "ratings": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "score": {"type": "number", "minimum": 0, "maximum": 10}
                        },
                        "required": ["name", "score"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["ratings"],
            "additionalProperties": false
        })
    }

    fn normalize(value: &mut Value) -> Result<(), String> {
        let items = require_array(value, "ratings")?;
        for item in items.iter_mut() {
            normalize_number_field(item, "score", 0.0, 10.0)?;
        }
        Ok(())
    }

    fn check(&self) -> Result<(), String> {
        if self.ratings.is_empty() {
            return Err("at least one rating is required".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Phase 3: research
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOutput {
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
}

impl PhaseOutput for ResearchOutput {
    fn schema_name() -> &'static str {
        "factor_research"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string"},
                "key_points": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["summary"],
            "additionalProperties": false
        })
    }

    fn check(&self) -> Result<(), String> {
        if self.summary.trim().is_empty() {
            return Err("summary must not be empty".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Phase 4: synthesis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisOutput {
    pub prediction_probability: f64,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub key_factors: Vec<String>,
}

impl PhaseOutput for SynthesisOutput {
    fn schema_name() -> &'static str {
        "forecast_synthesis"
    }

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "prediction_probability": {"type": "number", "minimum": 0, "maximum": 1},
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                "reasoning": {"type": "string"},
                "key_factors": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["prediction_probability", "confidence", "reasoning", "key_factors"],
            "additionalProperties": false
        })
    }

    fn normalize(value: &mut Value) -> Result<(), String> {
        normalize_number_field(value, "prediction_probability", 0.0, 1.0)?;
        normalize_number_field(value, "confidence", 0.0, 1.0)?;
        Ok(())
    }

    fn check(&self) -> Result<(), String> {
        if self.reasoning.trim().is_empty() {
            return Err("reasoning must not be empty".to_string());
        }
        Ok(())
    }
}
