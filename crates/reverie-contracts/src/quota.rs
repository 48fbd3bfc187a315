use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::store::DocumentMerge;

pub const FIELD_LAST_IMAGE_GEN_DATE: &str = "lastImageGenDate";
pub const FIELD_TOTAL_IMAGES_GENERATED: &str = "totalImagesGenerated";
pub const FIELD_LAST_IMAGE_PROMPT: &str = "lastImagePrompt";

/// Per-user image-generation counters. Read before the quota gate, mutated
/// only through [`commit_merge`] after a successful persist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotaRecord {
    pub last_image_gen_date: Option<String>,
    pub total_images_generated: u64,
    pub last_image_prompt: Option<String>,
}

impl QuotaRecord {
    pub fn from_document(document: &Map<String, Value>) -> Self {
        Self {
            last_image_gen_date: document
                .get(FIELD_LAST_IMAGE_GEN_DATE)
                .and_then(Value::as_str)
                .map(str::to_string),
            total_images_generated: document
                .get(FIELD_TOTAL_IMAGES_GENERATED)
                .and_then(Value::as_u64)
                .unwrap_or(0),
            last_image_prompt: document
                .get(FIELD_LAST_IMAGE_PROMPT)
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    /// Trial accounts get one image for the lifetime of the account.
    pub fn trial_exhausted(&self) -> bool {
        self.total_images_generated >= 1
    }

    /// Non-trial accounts get one image per UTC calendar date.
    pub fn daily_exhausted(&self, date_key: &str) -> bool {
        self.last_image_gen_date.as_deref() == Some(date_key)
    }
}

pub fn quota_document_key(user_id: &str) -> String {
    format!("users/{user_id}/stats/limits")
}

/// UTC calendar date key, e.g. "2026-02-01".
pub fn utc_date_key() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// The post-persist quota commit: date key and audit prompt are set, the
/// lifetime counter is incremented in the same merge-write.
pub fn commit_merge(date_key: &str, refined_prompt: &str) -> DocumentMerge {
    DocumentMerge::new()
        .set(FIELD_LAST_IMAGE_GEN_DATE, json!(date_key))
        .increment(FIELD_TOTAL_IMAGES_GENERATED, 1)
        .set(FIELD_LAST_IMAGE_PROMPT, json!(refined_prompt))
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::store::DocumentStore;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn record_parses_document_fields() {
        let record = QuotaRecord::from_document(&doc(json!({
            "lastImageGenDate": "2026-02-01",
            "totalImagesGenerated": 3,
            "lastImagePrompt": "a calm dream",
        })));
        assert_eq!(record.last_image_gen_date.as_deref(), Some("2026-02-01"));
        assert_eq!(record.total_images_generated, 3);
        assert_eq!(record.last_image_prompt.as_deref(), Some("a calm dream"));
    }

    #[test]
    fn empty_document_yields_default_record() {
        let record = QuotaRecord::from_document(&Map::new());
        assert_eq!(record, QuotaRecord::default());
        assert!(!record.trial_exhausted());
        assert!(!record.daily_exhausted("2026-02-01"));
    }

    #[test]
    fn trial_cap_ignores_dates() {
        let record = QuotaRecord {
            last_image_gen_date: Some("2020-01-01".to_string()),
            total_images_generated: 1,
            last_image_prompt: None,
        };
        assert!(record.trial_exhausted());
        assert!(!record.daily_exhausted("2026-02-01"));
    }

    #[test]
    fn daily_cap_resets_on_new_date_key() {
        let record = QuotaRecord {
            last_image_gen_date: Some("2026-02-01".to_string()),
            total_images_generated: 5,
            last_image_prompt: None,
        };
        assert!(record.daily_exhausted("2026-02-01"));
        assert!(!record.daily_exhausted("2026-02-02"));
    }

    #[test]
    fn commit_merge_increments_and_records_audit_prompt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DocumentStore::new(temp.path().join("documents.json"));
        let key = quota_document_key("u1");

        store.merge(&key, &commit_merge("2026-02-01", "first prompt"))?;
        store.merge(&key, &commit_merge("2026-02-02", "second prompt"))?;

        let record = QuotaRecord::from_document(&store.get(&key).unwrap_or_default());
        assert_eq!(record.total_images_generated, 2);
        assert_eq!(record.last_image_gen_date.as_deref(), Some("2026-02-02"));
        assert_eq!(record.last_image_prompt.as_deref(), Some("second prompt"));
        Ok(())
    }

    #[test]
    fn utc_date_key_shape() {
        let key = utc_date_key();
        assert_eq!(key.len(), 10);
        assert_eq!(key.as_bytes()[4], b'-');
        assert_eq!(key.as_bytes()[7], b'-');
    }
}
