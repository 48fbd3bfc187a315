use std::collections::BTreeMap;

use anyhow::{bail, Result};

pub type SlotValues = BTreeMap<String, String>;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Slot(String),
    Section {
        gate: String,
        present: PromptTemplate,
        absent: Option<PromptTemplate>,
    },
}

/// Declarative prompt model: literals, named slots, and sections gated on a
/// slot holding a non-empty value. Slot substitution is testable on its own,
/// independent of any generation call. Rendering a slot with no value is an
/// error; a missing gate slot just skips its section (or renders the
/// section's else-branch).
#[derive(Debug, Clone, Default)]
pub struct PromptTemplate {
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn literal(mut self, text: &str) -> Self {
        self.segments.push(Segment::Literal(text.to_string()));
        self
    }

    pub fn slot(mut self, name: &str) -> Self {
        self.segments.push(Segment::Slot(name.to_string()));
        self
    }

    pub fn section(mut self, gate: &str, present: PromptTemplate) -> Self {
        self.segments.push(Segment::Section {
            gate: gate.to_string(),
            present,
            absent: None,
        });
        self
    }

    pub fn section_or_else(
        mut self,
        gate: &str,
        present: PromptTemplate,
        absent: PromptTemplate,
    ) -> Self {
        self.segments.push(Segment::Section {
            gate: gate.to_string(),
            present,
            absent: Some(absent),
        });
        self
    }

    pub fn render(&self, values: &SlotValues) -> Result<String> {
        let mut out = String::new();
        self.render_into(&mut out, values)?;
        Ok(out)
    }

    fn render_into(&self, out: &mut String, values: &SlotValues) -> Result<()> {
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(name) => {
                    let Some(value) = values.get(name) else {
                        bail!("template slot '{name}' has no value");
                    };
                    out.push_str(value);
                }
                Segment::Section {
                    gate,
                    present,
                    absent,
                } => {
                    if gate_is_set(values, gate) {
                        present.render_into(out, values)?;
                    } else if let Some(absent) = absent {
                        absent.render_into(out, values)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn gate_is_set(values: &SlotValues, gate: &str) -> bool {
    values
        .get(gate)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
}
