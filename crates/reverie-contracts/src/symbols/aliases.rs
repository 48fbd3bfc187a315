/// Static mapping from near-duplicate or low-quality lookup keys to a single
/// canonical high-quality key. Canonicalization is a pure function of the raw
/// term and resolution is idempotent.
#[derive(Debug, Clone)]
pub struct AliasTable {
    entries: Vec<(&'static str, &'static str)>,
}

impl Default for AliasTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AliasTable {
    pub fn new() -> Self {
        Self {
            entries: vec![
                ("ladder", "stairs"),
                ("stair", "stairs"),
                ("steps", "stairs"),
                ("merdiven", "stairs"),
            ],
        }
    }

    /// Trims and lowercases the raw term, then maps known aliases to their
    /// canonical key. Unknown terms pass through unchanged.
    pub fn resolve(&self, raw: &str) -> String {
        let cleaned = raw.trim().to_lowercase();
        self.entries
            .iter()
            .find(|(alias, _)| *alias == cleaned)
            .map(|(_, canonical)| (*canonical).to_string())
            .unwrap_or(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::AliasTable;

    #[test]
    fn aliases_map_to_canonical_key() {
        let table = AliasTable::new();
        assert_eq!(table.resolve("ladder"), "stairs");
        assert_eq!(table.resolve("steps"), "stairs");
        assert_eq!(table.resolve("merdiven"), "stairs");
    }

    #[test]
    fn resolution_is_idempotent() {
        let table = AliasTable::new();
        let once = table.resolve("LADDER");
        assert_eq!(table.resolve(&once), once);
        assert_eq!(once, "stairs");
    }

    #[test]
    fn unknown_terms_pass_through_lowercased() {
        let table = AliasTable::new();
        assert_eq!(table.resolve("  DOG "), "dog");
        assert_eq!(table.resolve("teeth"), "teeth");
    }
}
