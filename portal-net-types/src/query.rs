use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Chain family of the dataset. Decides the shape of `fields` and filters, which
/// the client passes through untouched.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    #[default]
    Evm,
    Solana,
}

/// Per-table field selection, e.g. `{"block": {"number": true, "hash": true}}`.
#[derive(Default, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(transparent)]
pub struct FieldSelection(BTreeMap<String, BTreeMap<String, bool>>);

impl FieldSelection {
    pub fn select(mut self, table: &str, field: &str) -> Self {
        self.0
            .entry(table.to_owned())
            .or_default()
            .insert(field.to_owned(), true);
        self
    }

    pub fn is_selected(&self, table: &str, field: &str) -> bool {
        self.0
            .get(table)
            .and_then(|t| t.get(field))
            .copied()
            .unwrap_or(false)
    }

    /// Makes sure the block header carries everything a cursor needs.
    pub fn with_block_cursor_fields(self) -> Self {
        self.select("block", "number")
            .select("block", "hash")
            .select("block", "timestamp")
    }
}

#[derive(Default, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(rename = "type")]
    pub kind: ChainKind,
    /// The block to start the query from.
    pub from_block: u64,
    /// The block to end the query at, inclusive. If not specified the query follows the head.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_block: Option<u64>,
    /// Hash of the block right before `from_block`. The portal answers with `409` if its
    /// chain disagrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_block_hash: Option<String>,
    #[serde(default)]
    pub fields: FieldSelection,
    /// Chain specific data requests (`logs`, `transactions`, `instructions`...), passed through as is.
    #[serde(flatten)]
    pub filters: BTreeMap<String, Value>,
}

impl Query {
    pub fn new(kind: ChainKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_range(mut self, from_block: u64, to_block: Option<u64>) -> Self {
        self.from_block = from_block;
        self.to_block = to_block;
        self
    }

    pub fn with_fields(mut self, fields: FieldSelection) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_filter(mut self, name: &str, value: Value) -> Self {
        self.filters.insert(name.to_owned(), value);
        self
    }

    /// Moves the cursor right after the given block.
    pub fn advance(&mut self, number: u64, hash: &str) {
        self.from_block = number + 1;
        self.parent_block_hash = Some(hash.to_owned());
    }

    /// True once a bounded query has nothing left to fetch.
    pub fn is_exhausted(&self) -> bool {
        self.to_block.is_some_and(|to| self.from_block > to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_portal_shape() {
        let query = Query::new(ChainKind::Solana)
            .with_range(100, Some(200))
            .with_fields(FieldSelection::default().with_block_cursor_fields())
            .with_filter("instructions", json!([{ "programId": ["abc"] }]));

        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "solana",
                "fromBlock": 100,
                "toBlock": 200,
                "fields": { "block": { "number": true, "hash": true, "timestamp": true } },
                "instructions": [{ "programId": ["abc"] }],
            })
        );
    }

    #[test]
    fn deserialize_keeps_filters() {
        let query: Query = serde_json::from_value(json!({
            "type": "evm",
            "fromBlock": 1,
            "parentBlockHash": "0x1",
            "logs": [{ "address": ["0xa"] }],
        }))
        .unwrap();

        assert_eq!(query.kind, ChainKind::Evm);
        assert_eq!(query.parent_block_hash.as_deref(), Some("0x1"));
        assert!(query.filters.contains_key("logs"));
        assert!(!query.filters.contains_key("fromBlock"));
    }

    #[test]
    fn advance_and_exhaustion() {
        let mut query = Query::new(ChainKind::Evm).with_range(0, Some(2));
        assert!(!query.is_exhausted());

        query.advance(2, "0x456");
        assert_eq!(query.from_block, 3);
        assert_eq!(query.parent_block_hash.as_deref(), Some("0x456"));
        assert!(query.is_exhausted());

        let open = Query::new(ChainKind::Evm).with_range(u64::MAX - 1, None);
        assert!(!open.is_exhausted());
    }

    #[test]
    fn field_selection_lookup() {
        let fields = FieldSelection::default().select("log", "data");
        assert!(fields.is_selected("log", "data"));
        assert!(!fields.is_selected("log", "topics"));
        assert!(!fields.is_selected("block", "number"));
    }
}
