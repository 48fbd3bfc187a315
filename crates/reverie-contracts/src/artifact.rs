use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_TITLE: &str = "Dream Analysis";
pub const DEFAULT_INTERPRETATION: &str = "Interpretation unavailable.";

/// Immutable interpretation input. The language hint only selects a default
/// for flows with no text to detect from; detection always wins otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamSubmission {
    pub text: String,
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub language_hint: Option<String>,
}

impl DreamSubmission {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            mood: None,
            language_hint: None,
        }
    }
}

/// Final interpretation artifact. Every field is always present;
/// `cosmicCommentary` is explicitly nullable rather than omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpretationArtifact {
    pub title: String,
    pub definition: String,
    pub interpretation: String,
    pub cosmic_commentary: Option<String>,
}

impl InterpretationArtifact {
    /// Field-level defaults applied once per artifact so every consumer sees
    /// a fully-populated structure; a missing field never fails the request.
    pub fn resolve_defaults(payload: &Value) -> Self {
        Self {
            title: text_field(payload, "title", DEFAULT_TITLE),
            definition: text_field(payload, "definition", ""),
            interpretation: text_field(payload, "interpretation", DEFAULT_INTERPRETATION),
            cosmic_commentary: payload
                .get("cosmicCommentary")
                .or_else(|| payload.get("cosmicAnalysis"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string),
        }
    }

    /// Fallback for structured output that does not parse as JSON at all:
    /// the raw text becomes the interpretation, everything else defaults.
    pub fn fallback_from_text(raw: &str) -> Self {
        let trimmed = raw.trim();
        Self {
            title: DEFAULT_TITLE.to_string(),
            definition: String::new(),
            interpretation: if trimmed.is_empty() {
                DEFAULT_INTERPRETATION.to_string()
            } else {
                trimmed.to_string()
            },
            cosmic_commentary: None,
        }
    }
}

fn text_field(payload: &Value, name: &str, fallback: &str) -> String {
    payload
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Locale hint to language name; unknown hints fall back to English.
pub fn language_for_hint(hint: Option<&str>) -> &'static str {
    let Some(hint) = hint else {
        return "English";
    };
    match hint.trim().to_lowercase().as_str() {
        "tr" => "Turkish",
        "en" => "English",
        "es" => "Spanish",
        "de" => "German",
        "pt" => "Portuguese",
        _ => "English",
    }
}

/// One dated journal entry for the moon-sync analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoonJournalEntry {
    pub date: String,
    pub moon_phase: String,
    #[serde(default)]
    pub is_waxing: bool,
    #[serde(default)]
    pub astronomical_events: Vec<String>,
    pub mood: String,
    pub mood_intensity: u8,
    pub vividness: u8,
    pub word_count: u64,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn resolve_defaults_passes_populated_fields_through() {
        let artifact = InterpretationArtifact::resolve_defaults(&json!({
            "title": "The Watchful Dog",
            "definition": "Dogs embody loyalty.",
            "interpretation": "First paragraph.\n\nSecond paragraph.",
            "cosmicCommentary": "🌕 Full moon: release.",
        }));
        assert_eq!(artifact.title, "The Watchful Dog");
        assert_eq!(
            artifact.cosmic_commentary.as_deref(),
            Some("🌕 Full moon: release.")
        );
    }

    #[test]
    fn missing_commentary_resolves_to_null_not_absent_key() -> anyhow::Result<()> {
        let artifact = InterpretationArtifact::resolve_defaults(&json!({
            "title": "Dream",
        }));
        assert_eq!(artifact.cosmic_commentary, None);
        assert_eq!(artifact.definition, "");
        assert_eq!(artifact.interpretation, DEFAULT_INTERPRETATION);

        let serialized = serde_json::to_value(&artifact)?;
        let object = serialized.as_object().expect("object");
        assert!(object.contains_key("cosmicCommentary"));
        assert!(object["cosmicCommentary"].is_null());
        Ok(())
    }

    #[test]
    fn blank_fields_fall_back_like_missing_ones() {
        let artifact = InterpretationArtifact::resolve_defaults(&json!({
            "title": "   ",
            "cosmicCommentary": "",
        }));
        assert_eq!(artifact.title, DEFAULT_TITLE);
        assert_eq!(artifact.cosmic_commentary, None);
    }

    #[test]
    fn legacy_commentary_spelling_is_accepted() {
        let artifact = InterpretationArtifact::resolve_defaults(&json!({
            "cosmicAnalysis": "🌑 New moon: beginnings.",
        }));
        assert_eq!(
            artifact.cosmic_commentary.as_deref(),
            Some("🌑 New moon: beginnings.")
        );
    }

    #[test]
    fn raw_text_fallback_keeps_the_model_output() {
        let artifact = InterpretationArtifact::fallback_from_text("  plain prose answer  ");
        assert_eq!(artifact.interpretation, "plain prose answer");
        assert_eq!(artifact.title, DEFAULT_TITLE);
        assert_eq!(artifact.cosmic_commentary, None);
    }

    #[test]
    fn hint_maps_to_language_name_with_english_default() {
        assert_eq!(language_for_hint(Some("tr")), "Turkish");
        assert_eq!(language_for_hint(Some("PT")), "Portuguese");
        assert_eq!(language_for_hint(Some("xx")), "English");
        assert_eq!(language_for_hint(None), "English");
    }
}
