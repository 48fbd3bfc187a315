use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};

/// One field mutation inside a merge-write.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Set(Value),
    Increment(i64),
}

/// Ordered field mutations applied to a single document in one write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentMerge {
    ops: Vec<(String, FieldOp)>,
}

impl DocumentMerge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: Value) -> Self {
        self.ops.push((field.to_string(), FieldOp::Set(value)));
        self
    }

    pub fn increment(mut self, field: &str, by: i64) -> Self {
        self.ops.push((field.to_string(), FieldOp::Increment(by)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[(String, FieldOp)] {
        self.ops.as_slice()
    }
}

/// File-backed document store: one JSON object on disk, documents keyed by
/// string. Merge-writes are applied against the freshest on-disk state while
/// the store lock is held, so increments from concurrent requests never lose
/// updates. Clones share the lock; open one store per path and clone it.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    inner: Arc<DocumentStoreInner>,
}

#[derive(Debug)]
struct DocumentStoreInner {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DocumentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(DocumentStoreInner {
                path: path.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn get(&self, key: &str) -> Option<Map<String, Value>> {
        let _guard = self.guard();
        read_json_object(&self.inner.path)
            .and_then(|root| root.get(key).and_then(Value::as_object).cloned())
    }

    pub fn merge(&self, key: &str, merge: &DocumentMerge) -> anyhow::Result<()> {
        if merge.is_empty() {
            return Ok(());
        }
        let _guard = self.guard();
        let mut root = read_json_object(&self.inner.path).unwrap_or_default();
        let mut document = root
            .get(key)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (field, op) in merge.ops() {
            match op {
                FieldOp::Set(value) => {
                    document.insert(field.clone(), value.clone());
                }
                FieldOp::Increment(by) => {
                    let current = document.get(field).and_then(Value::as_i64).unwrap_or(0);
                    document.insert(field.clone(), Value::Number((current + by).into()));
                }
            }
        }
        root.insert(key.to_string(), Value::Object(document));
        write_json_object(&self.inner.path, &root)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.inner
            .lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{DocumentMerge, DocumentStore};

    #[test]
    fn merge_creates_document_with_set_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DocumentStore::new(temp.path().join("documents.json"));

        store.merge(
            "users/u1/stats/limits",
            &DocumentMerge::new().set("lastImageGenDate", json!("2026-02-01")),
        )?;

        let doc = store.get("users/u1/stats/limits").unwrap_or_default();
        assert_eq!(doc.get("lastImageGenDate"), Some(&json!("2026-02-01")));
        Ok(())
    }

    #[test]
    fn increment_starts_from_zero_and_accumulates() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DocumentStore::new(temp.path().join("documents.json"));

        store.merge("doc", &DocumentMerge::new().increment("count", 1))?;
        store.merge("doc", &DocumentMerge::new().increment("count", 2))?;

        let doc = store.get("doc").unwrap_or_default();
        assert_eq!(doc.get("count"), Some(&json!(3)));
        Ok(())
    }

    #[test]
    fn merge_preserves_untouched_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DocumentStore::new(temp.path().join("documents.json"));

        store.merge(
            "doc",
            &DocumentMerge::new()
                .set("a", json!(1))
                .set("prompt", json!("old")),
        )?;
        store.merge("doc", &DocumentMerge::new().set("prompt", json!("new")))?;

        let doc = store.get("doc").unwrap_or_default();
        assert_eq!(doc.get("a"), Some(&json!(1)));
        assert_eq!(doc.get("prompt"), Some(&json!("new")));
        Ok(())
    }

    #[test]
    fn concurrent_increments_do_not_lose_updates() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DocumentStore::new(temp.path().join("documents.json"));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let handle = store.clone();
                scope.spawn(move || {
                    handle
                        .merge("doc", &DocumentMerge::new().increment("count", 1))
                        .ok();
                });
            }
        });

        let doc = store.get("doc").unwrap_or_default();
        assert_eq!(doc.get("count"), Some(&json!(8)));
        Ok(())
    }

    #[test]
    fn separate_documents_do_not_interfere() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DocumentStore::new(temp.path().join("documents.json"));

        store.merge("a", &DocumentMerge::new().set("value", json!(1)))?;
        store.merge("b", &DocumentMerge::new().set("value", json!(2)))?;

        assert_eq!(
            store.get("a").unwrap_or_default().get("value"),
            Some(&json!(1))
        );
        assert_eq!(
            store.get("b").unwrap_or_default().get("value"),
            Some(&json!(2))
        );
        Ok(())
    }
}
