//! SQL values as an explicit tagged union.
//!
//! Every value read from a source table or decoded from a trigger snapshot is
//! turned into a [`SqlValue`] once, and all later decisions (which counters to
//! bump, whether it is a min/max candidate, whether it gets a distinct-value
//! bucket) dispatch on the tag.

use std::collections::BTreeMap;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Texts lexically inside this range look like dates and are not bucketed.
const DATE_FLOOR: &str = "1800-01-01";
const DATE_CEILING: &str = "9999-12-31";

/// Number of hex characters kept from the content hash.
const HASH_HEX_LEN: usize = 8;

/// A single SQLite value.
///
/// Serializes untagged so that primary key tuples persist as plain JSON
/// arrays (`[1]`, `["a", 2]`). Blobs serialize as arrays of bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// The SQLite `typeof()` name of this value.
    pub fn type_tag(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Integer(_) => "integer",
            SqlValue::Real(_) => "real",
            SqlValue::Text(_) => "text",
            SqlValue::Blob(_) => "blob",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value takes part in min/max tracking.
    ///
    /// Blobs and texts longer than `max_len` characters never do.
    pub fn is_min_max_candidate(&self, max_len: usize) -> bool {
        match self {
            SqlValue::Null | SqlValue::Blob(_) => false,
            SqlValue::Text(s) => s.chars().count() <= max_len,
            SqlValue::Integer(_) | SqlValue::Real(_) => true,
        }
    }

    /// Decode one `[type_tag, payload]` pair written by a change-capture trigger.
    fn from_tagged(tag: &str, payload: &serde_json::Value) -> Option<SqlValue> {
        match tag {
            "null" => Some(SqlValue::Null),
            "integer" => payload.as_i64().map(SqlValue::Integer),
            "real" => payload.as_f64().map(SqlValue::Real),
            "text" => payload.as_str().map(|s| SqlValue::Text(s.to_string())),
            "blob" => payload
                .as_str()
                .and_then(|h| hex::decode(h).ok())
                .map(SqlValue::Blob),
            _ => None,
        }
    }
}

impl FromSql for SqlValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(r) => SqlValue::Real(r),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        })
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            SqlValue::Null => ValueRef::Null,
            SqlValue::Integer(i) => ValueRef::Integer(*i),
            SqlValue::Real(r) => ValueRef::Real(*r),
            SqlValue::Text(s) => ValueRef::Text(s.as_bytes()),
            SqlValue::Blob(b) => ValueRef::Blob(b),
        }))
    }
}

/// A primary key tuple, in declared key order (or `[rowid]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKey(pub Vec<SqlValue>);

impl PrimaryKey {
    pub fn values(&self) -> &[SqlValue] {
        &self.0
    }
}

/// Column name to value, as captured before or after a write.
pub type RowSnapshot = BTreeMap<String, SqlValue>;

/// Decode a trigger snapshot (`{"col": [type_tag, payload], ...}`).
///
/// Returns `None` if the text is not a JSON object at all. Individual
/// columns whose pair cannot be decoded are dropped.
pub fn decode_snapshot(json: &str) -> Option<RowSnapshot> {
    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json).ok()?;

    let snapshot = object
        .into_iter()
        .filter_map(|(column, pair)| {
            let pair = pair.as_array()?;
            let tag = pair.first()?.as_str()?;
            let payload = pair.get(1).unwrap_or(&serde_json::Value::Null);
            SqlValue::from_tagged(tag, payload).map(|v| (column, v))
        })
        .collect();

    Some(snapshot)
}

/// JSON shape of a text value, as counted in column stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    String,
    Array,
    Object,
    Other,
}

/// Classify a text as JSON. Invalid JSON yields `None`.
pub fn json_kind(s: &str) -> Option<JsonKind> {
    match serde_json::from_str::<serde_json::Value>(s).ok()? {
        serde_json::Value::String(_) => Some(JsonKind::String),
        serde_json::Value::Array(_) => Some(JsonKind::Array),
        serde_json::Value::Object(_) => Some(JsonKind::Object),
        _ => Some(JsonKind::Other),
    }
}

fn json_array(s: &str) -> Option<Vec<serde_json::Value>> {
    // Cheap reject before handing every text to the JSON parser
    if !s.trim_start().starts_with('[') {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(s).ok()? {
        serde_json::Value::Array(items) => Some(items),
        _ => None,
    }
}

/// Whether a text qualifies for the distinct-value index.
///
/// Excludes long texts, date-like texts, URLs, integers and JSON arrays
/// (arrays are expanded by [`array_terms`] instead).
pub fn is_indexable_text(s: &str, max_len: usize) -> bool {
    s.chars().count() <= max_len
        && !(DATE_FLOOR..=DATE_CEILING).contains(&s)
        && !s.starts_with("http://")
        && !s.starts_with("https://")
        && s.trim().parse::<i64>().is_err()
        && json_array(s).is_none()
}

/// The text itself, if it qualifies as a term.
pub fn scalar_term(s: &str, max_len: usize) -> Option<&str> {
    is_indexable_text(s, max_len).then_some(s)
}

/// Qualifying string elements of a text holding a JSON array.
pub fn array_terms(s: &str, max_len: usize) -> Vec<String> {
    json_array(s)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| match item {
            serde_json::Value::String(e) if is_indexable_text(&e, max_len) => Some(e),
            _ => None,
        })
        .collect()
}

/// All terms a value contributes to the distinct-value index.
pub fn index_terms(value: &SqlValue, max_len: usize) -> Vec<String> {
    match value.as_text() {
        Some(s) => match scalar_term(s, max_len) {
            Some(term) => vec![term.to_string()],
            None => array_terms(s, max_len),
        },
        None => Vec::new(),
    }
}

/// First hex characters of the SHA-256 of the full value.
pub fn content_hash(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(HASH_HEX_LEN);
    encoded
}

/// Lowercase and cut to `key_len` characters.
pub fn truncate_key(s: &str, key_len: usize) -> String {
    s.to_lowercase().chars().take(key_len).collect()
}

/// Identity of a distinct-value bucket within a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    /// Lowercased value truncated to the key length.
    pub value: String,
    /// Content hash of the full value; tells apart values sharing a prefix.
    pub hash: String,
}

impl BucketKey {
    pub fn new(term: &str, key_len: usize) -> Self {
        Self {
            value: truncate_key(term, key_len),
            hash: content_hash(term),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_key_serializes_as_plain_array() {
        let pk = PrimaryKey(vec![SqlValue::Integer(1), SqlValue::Text("a".into())]);
        assert_eq!(serde_json::to_string(&pk).unwrap(), r#"[1,"a"]"#);

        let back: PrimaryKey = serde_json::from_str(r#"[1,"a",2.5,null]"#).unwrap();
        assert_eq!(
            back.values(),
            &[
                SqlValue::Integer(1),
                SqlValue::Text("a".into()),
                SqlValue::Real(2.5),
                SqlValue::Null
            ]
        );
    }

    #[test]
    fn test_decode_snapshot_with_blob_and_real() {
        let json = r#"{"id":["integer",3],"blobby":["blob","CAFE"],"ratio":["real",0.5],"title":["null",null]}"#;
        let snap = decode_snapshot(json).unwrap();
        assert_eq!(snap["id"], SqlValue::Integer(3));
        assert_eq!(snap["blobby"], SqlValue::Blob(vec![0xca, 0xfe]));
        assert_eq!(snap["ratio"], SqlValue::Real(0.5));
        assert_eq!(snap["title"], SqlValue::Null);
    }

    #[test]
    fn test_decode_snapshot_rejects_garbage() {
        assert!(decode_snapshot("not json").is_none());
        assert!(decode_snapshot("[1,2]").is_none());
        // A malformed column is dropped, the rest survives
        let snap = decode_snapshot(r#"{"a":["integer","x"],"b":["text","ok"]}"#).unwrap();
        assert!(!snap.contains_key("a"));
        assert_eq!(snap["b"], SqlValue::Text("ok".into()));
    }

    #[test]
    fn test_indexable_text_filter() {
        assert!(is_indexable_text("title1", 100));
        assert!(is_indexable_text("not json", 100));
        assert!(!is_indexable_text(&"x".repeat(101), 100));
        assert!(!is_indexable_text("2023-04-01", 100));
        assert!(!is_indexable_text("https://example.com", 100));
        assert!(!is_indexable_text("http://example.com", 100));
        assert!(!is_indexable_text("42", 100));
        assert!(!is_indexable_text(r#"["foo"]"#, 100));
        // Objects are not arrays, they are indexed verbatim
        assert!(is_indexable_text(r#"{"a":1}"#, 100));
    }

    #[test]
    fn test_index_terms_expands_arrays() {
        let v = SqlValue::Text(r#"["foo", "Bar", 3, "2020-01-01"]"#.into());
        assert_eq!(index_terms(&v, 100), vec!["foo".to_string(), "Bar".to_string()]);
        assert!(index_terms(&SqlValue::Integer(3), 100).is_empty());
        assert_eq!(index_terms(&SqlValue::Text("Apple".into()), 100), vec!["Apple"]);
    }

    #[test]
    fn test_bucket_key_truncates_and_hashes() {
        let a = "A very long title that goes on and on";
        let b = "A very long title that differs later";
        let ka = BucketKey::new(a, 20);
        let kb = BucketKey::new(b, 20);
        assert_eq!(ka.value, "a very long title th");
        assert_eq!(ka.value, kb.value);
        assert_ne!(ka.hash, kb.hash);
        assert_eq!(ka.hash.len(), 8);
    }

    #[test]
    fn test_min_max_candidates() {
        assert!(SqlValue::Integer(1).is_min_max_candidate(100));
        assert!(SqlValue::Text("short".into()).is_min_max_candidate(100));
        assert!(!SqlValue::Text("y".repeat(101)).is_min_max_candidate(100));
        assert!(!SqlValue::Blob(vec![1]).is_min_max_candidate(100));
        assert!(!SqlValue::Null.is_min_max_candidate(100));
    }

    #[test]
    fn test_json_kind() {
        assert_eq!(json_kind(r#""s""#), Some(JsonKind::String));
        assert_eq!(json_kind("[1]"), Some(JsonKind::Array));
        assert_eq!(json_kind("{}"), Some(JsonKind::Object));
        assert_eq!(json_kind("12"), Some(JsonKind::Other));
        assert_eq!(json_kind("not json"), None);
    }
}
