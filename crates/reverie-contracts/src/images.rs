use serde::{Deserialize, Serialize};

/// One image-generation request. `user_id` carries the authenticated
/// identity; an empty value is rejected before any collaborator is touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    pub dream_text: String,
    pub dream_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub is_trial: bool,
}

/// Deterministic object path for a request identity; the idempotency guard
/// and the persist stage must agree on this.
pub fn image_object_path(namespace: &str, user_id: &str, dream_id: &str) -> String {
    format!("{namespace}/{user_id}/{dream_id}.png")
}

/// A persisted image as the workflow sees it after the persist stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub storage_path: String,
    pub public_url: String,
    pub refined_prompt: String,
}

/// What callers receive: a freshly generated image, or a cached marker when
/// the idempotency guard short-circuits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ImageOutcome {
    #[serde(rename_all = "camelCase")]
    Generated {
        image_url: String,
        refined_prompt: String,
    },
    #[serde(rename_all = "camelCase")]
    Cached { image_url: String },
}
