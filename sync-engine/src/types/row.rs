use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Image of the non-key columns of a row, keyed by column name.
pub type RowImage = BTreeMap<String, Value>;

/// Primary key of a row, one value per key column in key order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKey(Vec<Value>);

impl PrimaryKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Returns an injective textual form of the key, used to index persisted state.
    pub fn key_text(&self) -> String {
        let mut out = String::new();
        for (index, value) in self.0.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            value.write_key_text(&mut out);
        }
        out
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (index, value) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

/// A row read from a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub key: PrimaryKey,
    pub values: RowImage,
}

impl TableRow {
    pub fn new(key: PrimaryKey, values: RowImage) -> Self {
        Self { key, values }
    }
}

/// Restricts an image to the given columns. Missing columns become [`Value::Null`].
pub fn project(image: &RowImage, columns: &[String]) -> RowImage {
    columns
        .iter()
        .map(|column| {
            let value = image.get(column).cloned().unwrap_or(Value::Null);
            (column.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_keys_render_and_index() {
        let key = PrimaryKey::new(vec![Value::from("north"), Value::Integer(7)]);

        assert_eq!(key.to_string(), r#"("north", 7)"#);
        assert_eq!(key.key_text(), "t5:north,i7");
    }

    #[test]
    fn projection_drops_unknown_and_fills_missing_columns() {
        let image = RowImage::from([
            ("v".to_string(), Value::from("A")),
            ("extra".to_string(), Value::Integer(1)),
        ]);

        let projected = project(&image, &["v".to_string(), "w".to_string()]);

        assert_eq!(
            projected,
            RowImage::from([
                ("v".to_string(), Value::from("A")),
                ("w".to_string(), Value::Null),
            ])
        );
    }
}
