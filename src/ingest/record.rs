use std::path::PathBuf;

use super::schema::Value;

/// Where a record came from
#[derive(Debug, Clone, PartialEq)]
pub struct Provenance {
    pub source_file: PathBuf,
    /// 1-based index of the data row (header excluded)
    pub row_index: usize,
}

/// One validated row: canonical column name → typed value, in header order.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    fields: Vec<(String, Value)>,
    provenance: Provenance,
}

impl NormalizedRecord {
    pub fn new(fields: Vec<(String, Value)>, provenance: Provenance) -> Self {
        Self { fields, provenance }
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Serialize fields as a JSON object, preserving column order.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::with_capacity(self.fields.len());
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(map)
    }
}

/// Idempotency key for one row of one file version.
pub fn idempotency_key(content_hash: &str, row_index: usize) -> String {
    format!("{}:{}", content_hash, row_index)
}

/// Records from a single file version headed for one table.
#[derive(Debug, Clone)]
pub struct IngestionBatch {
    pub table_id: String,
    pub content_hash: String,
    pub records: Vec<NormalizedRecord>,
}

impl IngestionBatch {
    pub fn new(table_id: impl Into<String>, content_hash: impl Into<String>, records: Vec<NormalizedRecord>) -> Self {
        Self {
            table_id: table_id.into(),
            content_hash: content_hash.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records paired with their idempotency keys.
    pub fn keyed(&self) -> impl Iterator<Item = (String, &NormalizedRecord)> {
        self.records
            .iter()
            .map(move |r| (idempotency_key(&self.content_hash, r.provenance().row_index), r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(row: usize) -> NormalizedRecord {
        NormalizedRecord::new(
            vec![
                ("id".to_string(), Value::String(format!("p{}", row))),
                ("price".to_string(), Value::Number(9.5)),
            ],
            Provenance {
                source_file: PathBuf::from("in/products.csv"),
                row_index: row,
            },
        )
    }

    #[test]
    fn test_keys_derive_from_hash_and_row() {
        let batch = IngestionBatch::new("products", "abc", vec![record(1), record(2)]);
        let keys: Vec<String> = batch.keyed().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["abc:1".to_string(), "abc:2".to_string()]);
    }

    #[test]
    fn test_record_json_preserves_order() {
        let json = record(3).to_json().to_string();
        assert_eq!(json, r#"{"id":"p3","price":9.5}"#);
        assert_eq!(record(3).get("price"), Some(&Value::Number(9.5)));
        assert!(record(3).get("missing").is_none());
    }
}
