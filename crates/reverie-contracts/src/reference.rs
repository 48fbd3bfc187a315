use serde::{Deserialize, Serialize};

/// One scenario entry from the reference-lookup collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScenarioEntry {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct InterpretationNotes {
    pub psychological: Option<String>,
    pub spiritual: Option<String>,
}

/// Reference data for one resolved symbol, as returned by
/// `GET /meaning/{canonicalKey}`. Every field is optional on the wire; a
/// record with no usable fields is treated as "no record".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceRecord {
    pub meaning: Option<String>,
    pub symbolism: Option<String>,
    pub interpretations: Option<InterpretationNotes>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioEntry>,
    #[serde(alias = "cosmicAnalysis")]
    pub supplementary_commentary: Option<String>,
}

impl ReferenceRecord {
    pub fn is_empty(&self) -> bool {
        non_empty(&self.meaning).is_none()
            && non_empty(&self.symbolism).is_none()
            && self
                .interpretations
                .as_ref()
                .map(|notes| {
                    non_empty(&notes.psychological).is_none()
                        && non_empty(&notes.spiritual).is_none()
                })
                .unwrap_or(true)
            && self.scenarios.is_empty()
            && non_empty(&self.supplementary_commentary).is_none()
    }

    /// Short encyclopedic meaning; the synthesis prompt routes this into the
    /// artifact's `definition` field.
    pub fn intro_meaning(&self) -> &str {
        non_empty(&self.meaning)
            .or_else(|| non_empty(&self.symbolism))
            .unwrap_or("Symbolic meaning unavailable.")
    }

    /// Psychological and spiritual notes, one per line; falls back to the
    /// symbolism summary when both notes are absent.
    pub fn body_notes(&self) -> String {
        let mut parts = Vec::new();
        if let Some(notes) = &self.interpretations {
            if let Some(psychological) = non_empty(&notes.psychological) {
                parts.push(format!("Psychological: {psychological}"));
            }
            if let Some(spiritual) = non_empty(&notes.spiritual) {
                parts.push(format!("Spiritual: {spiritual}"));
            }
        }
        if parts.is_empty() {
            return non_empty(&self.symbolism).unwrap_or_default().to_string();
        }
        parts.join("\n")
    }

    /// Templated reference block for one symbol. The {SYM_*} tags are the
    /// slots the synthesis prompt instructs the model to read from.
    pub fn render_block(&self, symbol_label: &str) -> String {
        let mut lines = vec![
            format!("SYMBOL: {symbol_label}"),
            format!("{{SYM_INTRO}}: {}", self.intro_meaning()),
            format!("{{SYM_BODY}}: {}", self.body_notes()),
            "{SYM_SCENARIOS}:".to_string(),
        ];
        for scenario in &self.scenarios {
            lines.push(format!("- {}: {}", scenario.title, scenario.description));
        }
        lines.join("\n")
    }
}

/// Rendered reference blocks (one per candidate with a usable record, in the
/// original candidate order) plus the aggregated supplementary-commentary
/// buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InterpretationContext {
    pub blocks: Vec<String>,
    pub commentary: Option<String>,
}

impl InterpretationContext {
    /// `resolved` pairs each candidate with its fetched record, in original
    /// candidate order; failed lookups carry `None` and contribute nothing.
    pub fn assemble(resolved: &[(String, Option<ReferenceRecord>)]) -> Self {
        let mut blocks = Vec::new();
        let mut commentary_parts = Vec::new();
        for (symbol, record) in resolved {
            let Some(record) = record else {
                continue;
            };
            if record.is_empty() {
                continue;
            }
            blocks.push(record.render_block(&symbol.to_uppercase()));
            if let Some(fragment) = non_empty(&record.supplementary_commentary) {
                commentary_parts.push(fragment.to_string());
            }
        }
        let commentary = if commentary_parts.is_empty() {
            None
        } else {
            Some(commentary_parts.join("\n\n"))
        };
        Self { blocks, commentary }
    }

    /// Grounding section for the synthesis prompt. An empty candidate set
    /// yields an empty string, not an error.
    pub fn reference_section(&self) -> String {
        if self.blocks.is_empty() {
            return String::new();
        }
        format!(
            "### [REFERENCE DATA] (Grounding Data)\n{}",
            self.blocks.join("\n\n")
        )
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{InterpretationContext, ReferenceRecord, ScenarioEntry};

    fn record(json: serde_json::Value) -> ReferenceRecord {
        serde_json::from_value(json).unwrap_or_default()
    }

    #[test]
    fn wire_fields_deserialize_including_legacy_commentary_spelling() {
        let parsed = record(serde_json::json!({
            "meaning": "A dog stands for loyalty.",
            "interpretations": {"psychological": "Instinct.", "spiritual": "Guardianship."},
            "scenarios": [{"title": "Chased", "description": "Avoidance."}],
            "cosmicAnalysis": "Full moon heightens recall.",
        }));
        assert_eq!(parsed.intro_meaning(), "A dog stands for loyalty.");
        assert_eq!(
            parsed.supplementary_commentary.as_deref(),
            Some("Full moon heightens recall.")
        );
        assert_eq!(parsed.scenarios.len(), 1);
    }

    #[test]
    fn body_notes_fall_back_to_symbolism() {
        let parsed = record(serde_json::json!({"symbolism": "Transition."}));
        assert_eq!(parsed.body_notes(), "Transition.");
        assert_eq!(parsed.intro_meaning(), "Transition.");
    }

    #[test]
    fn record_without_usable_fields_is_empty() {
        assert!(ReferenceRecord::default().is_empty());
        assert!(record(serde_json::json!({"meaning": "  "})).is_empty());
        assert!(!record(serde_json::json!({"meaning": "Water."})).is_empty());
    }

    #[test]
    fn render_block_lists_scenarios_one_per_line() {
        let parsed = ReferenceRecord {
            meaning: Some("Ascent.".to_string()),
            scenarios: vec![
                ScenarioEntry {
                    title: "Climbing".to_string(),
                    description: "Effort toward a goal.".to_string(),
                },
                ScenarioEntry {
                    title: "Stuck".to_string(),
                    description: "Misdirected energy.".to_string(),
                },
            ],
            ..ReferenceRecord::default()
        };
        let block = parsed.render_block("STAIRS");
        assert!(block.starts_with("SYMBOL: STAIRS\n"));
        assert!(block.contains("{SYM_INTRO}: Ascent."));
        assert!(block.contains("- Climbing: Effort toward a goal."));
        assert!(block.contains("- Stuck: Misdirected energy."));
    }

    #[test]
    fn assemble_preserves_candidate_order_and_skips_failures() {
        let resolved = vec![
            (
                "DOG".to_string(),
                Some(record(serde_json::json!({"meaning": "Loyalty."}))),
            ),
            ("HOUSE".to_string(), None),
            (
                "stairs".to_string(),
                Some(record(serde_json::json!({"meaning": "Ascent."}))),
            ),
        ];
        let context = InterpretationContext::assemble(&resolved);
        assert_eq!(context.blocks.len(), 2);
        assert!(context.blocks[0].starts_with("SYMBOL: DOG"));
        assert!(context.blocks[1].starts_with("SYMBOL: STAIRS"));
        assert!(context.commentary.is_none());
    }

    #[test]
    fn commentary_fragments_merge_independently_of_blocks() {
        let resolved = vec![
            (
                "DOG".to_string(),
                Some(record(serde_json::json!({
                    "meaning": "Loyalty.",
                    "supplementaryCommentary": "New moon: beginnings.",
                }))),
            ),
            (
                "STAIRS".to_string(),
                Some(record(serde_json::json!({
                    "meaning": "Ascent.",
                    "supplementaryCommentary": "Full moon: release.",
                }))),
            ),
        ];
        let context = InterpretationContext::assemble(&resolved);
        assert_eq!(
            context.commentary.as_deref(),
            Some("New moon: beginnings.\n\nFull moon: release.")
        );
    }

    #[test]
    fn empty_candidate_set_yields_empty_section() {
        let context = InterpretationContext::assemble(&[]);
        assert_eq!(context.reference_section(), "");
        let with_block = InterpretationContext::assemble(&[(
            "DOG".to_string(),
            Some(record(serde_json::json!({"meaning": "Loyalty."}))),
        )]);
        assert!(with_block
            .reference_section()
            .starts_with("### [REFERENCE DATA] (Grounding Data)\n"));
    }

    #[test]
    fn empty_record_contributes_no_block_but_order_survives() {
        let resolved = vec![
            ("DOG".to_string(), Some(ReferenceRecord::default())),
            (
                "TEETH".to_string(),
                Some(record(serde_json::json!({"meaning": "Loss."}))),
            ),
        ];
        let context = InterpretationContext::assemble(&resolved);
        assert_eq!(context.blocks.len(), 1);
        assert!(context.blocks[0].starts_with("SYMBOL: TEETH"));
    }
}
