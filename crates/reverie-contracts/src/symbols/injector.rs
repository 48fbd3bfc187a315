use super::aliases::AliasTable;
use super::MAX_SYMBOLS;

/// One fail-safe rule: if any needle appears in the raw dream text and no
/// equivalent of the canonical symbol was extracted, the symbol is injected.
#[derive(Debug, Clone, Copy)]
pub struct InjectionRule {
    pub canonical: &'static str,
    pub needles: &'static [&'static str],
}

/// High-value symbols the extraction model misses often enough to warrant a
/// deterministic backstop. Needles cover the language variants seen in
/// production traffic.
pub fn default_rules() -> &'static [InjectionRule] {
    &[InjectionRule {
        canonical: "STAIRS",
        needles: &["merdiven", "ladder", "stair", "basamak"],
    }]
}

/// Deterministic substring scan over the raw text. Equivalence is judged
/// after alias resolution, so an extracted "LADDER" already counts as
/// "stairs". When the candidate list is full, the last (least dominant)
/// candidate gives way so the fail-safe symbol still reaches lookup.
/// Idempotent: re-running on an already-injected list is a no-op.
pub fn inject_missed_symbols(
    aliases: &AliasTable,
    text: &str,
    candidates: &mut Vec<String>,
) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut injected = Vec::new();
    for rule in default_rules() {
        if !rule.needles.iter().any(|needle| lowered.contains(needle)) {
            continue;
        }
        let canonical_key = aliases.resolve(rule.canonical);
        if candidates
            .iter()
            .any(|candidate| aliases.resolve(candidate) == canonical_key)
        {
            continue;
        }
        if candidates.len() >= MAX_SYMBOLS {
            candidates.pop();
        }
        candidates.push(rule.canonical.to_string());
        injected.push(rule.canonical.to_string());
    }
    injected
}

#[cfg(test)]
mod tests {
    use super::super::aliases::AliasTable;
    use super::inject_missed_symbols;

    #[test]
    fn injects_stairs_when_needle_present_and_missing() {
        let aliases = AliasTable::new();
        let mut candidates = vec!["TEETH".to_string()];
        let injected =
            inject_missed_symbols(&aliases, "Merdiven çıkıyordum ama yoruldum", &mut candidates);
        assert_eq!(injected, vec!["STAIRS".to_string()]);
        assert_eq!(candidates, vec!["TEETH".to_string(), "STAIRS".to_string()]);
    }

    #[test]
    fn alias_equivalent_candidate_blocks_injection() {
        let aliases = AliasTable::new();
        let mut candidates = vec!["LADDER".to_string()];
        let injected = inject_missed_symbols(&aliases, "I climbed a ladder", &mut candidates);
        assert!(injected.is_empty());
        assert_eq!(candidates, vec!["LADDER".to_string()]);
    }

    #[test]
    fn injection_is_idempotent() {
        let aliases = AliasTable::new();
        let mut candidates = vec!["DOG".to_string()];
        inject_missed_symbols(&aliases, "a dog on the stairs", &mut candidates);
        let after_first = candidates.clone();
        let injected = inject_missed_symbols(&aliases, "a dog on the stairs", &mut candidates);
        assert!(injected.is_empty());
        assert_eq!(candidates, after_first);
    }

    #[test]
    fn full_list_drops_last_candidate_for_the_fail_safe() {
        let aliases = AliasTable::new();
        let mut candidates = vec![
            "DOG".to_string(),
            "HOUSE".to_string(),
            "TEETH".to_string(),
        ];
        inject_missed_symbols(&aliases, "dişlerim basamakta döküldü", &mut candidates);
        assert_eq!(
            candidates,
            vec!["DOG".to_string(), "HOUSE".to_string(), "STAIRS".to_string()]
        );
    }

    #[test]
    fn text_without_needles_is_untouched() {
        let aliases = AliasTable::new();
        let mut candidates = vec!["DOG".to_string()];
        let injected =
            inject_missed_symbols(&aliases, "I was running from a big dog", &mut candidates);
        assert!(injected.is_empty());
        assert_eq!(candidates, vec!["DOG".to_string()]);
    }
}
