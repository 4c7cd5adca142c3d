use std::fmt;
use std::fmt::Write;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::RowImage;

/// SHA-256 over the canonical encoding of a row image, rendered as lowercase hex.
///
/// Columns are encoded in name order as length prefixed names followed by type tagged
/// values. The `excluded` column, the modification timestamp, never contributes so rows that
/// differ only in that column share a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(image: &RowImage, excluded: Option<&str>) -> Self {
        let mut buf = Vec::new();
        for (column, value) in image {
            if Some(column.as_str()) == excluded {
                continue;
            }

            buf.extend_from_slice(&(column.len() as u64).to_be_bytes());
            buf.extend_from_slice(column.as_bytes());
            value.encode_canonical(&mut buf);
        }

        let digest = Sha256::digest(&buf);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }

        Fingerprint(hex)
    }

    /// Wraps a previously computed fingerprint.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Fingerprint(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::types::Value;

    fn image(v: &str, hour: u32) -> RowImage {
        RowImage::from([
            ("v".to_string(), Value::from(v)),
            (
                "updated_at".to_string(),
                Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()),
            ),
        ])
    }

    #[test]
    fn is_deterministic_hex() {
        let fingerprint = Fingerprint::of(&image("A", 1), None);

        assert_eq!(fingerprint, Fingerprint::of(&image("A", 1), None));
        assert_eq!(fingerprint.as_str().len(), 64);
        assert!(fingerprint.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn modification_column_is_excluded() {
        assert_ne!(
            Fingerprint::of(&image("A", 1), None),
            Fingerprint::of(&image("A", 2), None)
        );
        assert_eq!(
            Fingerprint::of(&image("A", 1), Some("updated_at")),
            Fingerprint::of(&image("A", 2), Some("updated_at"))
        );
        assert_ne!(
            Fingerprint::of(&image("A", 1), Some("updated_at")),
            Fingerprint::of(&image("B", 1), Some("updated_at"))
        );
    }

    #[test]
    fn value_kinds_do_not_collide() {
        let text = RowImage::from([("v".to_string(), Value::from("1"))]);
        let integer = RowImage::from([("v".to_string(), Value::Integer(1))]);

        assert_ne!(Fingerprint::of(&text, None), Fingerprint::of(&integer, None));
    }
}
