use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

/// Free-form metadata. Ordered so serialized forms hash deterministically.
pub type Metadata = BTreeMap<String, JsonValue>;

const SPEC_PREFIX: &str = "com.numary.spec/";

/// Key set on a revert transaction, holding the id of the transaction it reverts.
pub fn reverts_key() -> String {
    format!("{}state/reverts", SPEC_PREFIX)
}

/// Key set on a reverted transaction, holding the id of its revert.
pub fn reverted_key() -> String {
    format!("{}state/reverted", SPEC_PREFIX)
}

pub fn mark_reverts(metadata: &mut Metadata, reverted_id: u64) {
    metadata.insert(reverts_key(), JsonValue::String(reverted_id.to_string()));
}

pub fn mark_reverted(metadata: &mut Metadata, revert_id: u64) {
    metadata.insert(reverted_key(), JsonValue::String(revert_id.to_string()));
}

pub fn is_reverted(metadata: &Metadata) -> bool {
    metadata.contains_key(&reverted_key())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revert_marks() {
        let mut metadata = Metadata::new();
        assert!(!is_reverted(&metadata));
        mark_reverted(&mut metadata, 4);
        assert!(is_reverted(&metadata));
        assert_eq!(metadata[&reverted_key()], JsonValue::String("4".into()));

        let mut revert = Metadata::new();
        mark_reverts(&mut revert, 2);
        assert_eq!(revert[&reverts_key()], JsonValue::String("2".into()));
        assert!(!is_reverted(&revert));
    }
}
