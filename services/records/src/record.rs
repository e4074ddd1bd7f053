//! Loosely-typed sales records
//!
//! A record is whatever the uploaded sheet had in its header row. Only a
//! handful of fields carry meaning for consolidation and querying; those are
//! read through the typed accessors below and everything else is passed
//! through untouched.

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

pub const CATEGORY_FIELD: &str = "CategoryShortName";
pub const BRANCH_FIELD: &str = "branch";
pub const SUPPLIER_FIELD: &str = "SupplierAlias";
pub const ARTICLE_FIELD: &str = "ArticleNo";

/// Field names owned by the store rather than by the uploaded data
pub const LIFECYCLE_FIELDS: &[&str] = &["_id", "__v", "createdAt", "updatedAt"];

// ============================================================================
// Measures
// ============================================================================

/// The four numeric measures that consolidation sums and totals aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measure {
    NetSlsQty,
    NetAmount,
    NetSlsCostValue,
    SlsExtCostValue,
}

impl Measure {
    pub const ALL: [Measure; 4] = [
        Measure::NetSlsQty,
        Measure::NetAmount,
        Measure::NetSlsCostValue,
        Measure::SlsExtCostValue,
    ];

    /// Field name of this measure inside a record
    pub fn field(self) -> &'static str {
        match self {
            Measure::NetSlsQty => "NetSlsQty",
            Measure::NetAmount => "NetAmount",
            Measure::NetSlsCostValue => "NetSlsCostValue",
            Measure::SlsExtCostValue => "SlsExtCostValue",
        }
    }
}

/// Result of reading a measure value out of a record
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeasureValue {
    /// A number, or text starting with one ("12abc" reads as 12)
    Parsed(f64),
    /// Absent, null or blank
    Missing,
    /// Present but not a finite number ("abc", true, "NaN", ...)
    Unparseable,
}

/// Byte length of the longest decimal number at the start of `s`:
/// optional sign, digits with an optional fraction, optional exponent.
/// Zero when `s` does not start with a number.
fn leading_number_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let digits_from = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let int_end = digits_from(end);
    let mut mantissa_digits = int_end - end;
    end = int_end;

    if bytes.get(end) == Some(&b'.') {
        let frac_end = digits_from(end + 1);
        mantissa_digits += frac_end - (end + 1);
        end = frac_end;
    }
    if mantissa_digits == 0 {
        return 0;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_end = digits_from(exp);
        if exp_end > exp {
            end = exp_end;
        }
    }
    end
}

/// Parse the leading number of `s`, ignoring whatever follows it
fn parse_leading_number(s: &str) -> Option<f64> {
    match leading_number_len(s) {
        0 => None,
        len => s[..len].parse::<f64>().ok(),
    }
}

impl MeasureValue {
    pub fn read(value: Option<&Value>) -> Self {
        let parsed = match value {
            None | Some(Value::Null) => return MeasureValue::Missing,
            Some(Value::String(s)) if s.trim().is_empty() => return MeasureValue::Missing,
            Some(Value::String(s)) => parse_leading_number(s.trim()),
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::Bool(_)) | Some(Value::Array(_)) | Some(Value::Object(_)) => None,
        };

        match parsed {
            Some(v) if v.is_finite() => MeasureValue::Parsed(v),
            _ => MeasureValue::Unparseable,
        }
    }

    /// Missing and unparseable values count as zero
    pub fn as_f64(self) -> f64 {
        match self {
            MeasureValue::Parsed(v) => v,
            MeasureValue::Missing | MeasureValue::Unparseable => 0.0,
        }
    }
}

/// Coerce a raw field value to a number, silently using 0 on failure
pub fn coerce_number(value: Option<&Value>) -> f64 {
    MeasureValue::read(value).as_f64()
}

/// Build a JSON number, falling back to null for values JSON cannot hold
pub fn number_value(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < 9.0e15 {
        return Value::from(v as i64);
    }
    match Number::from_f64(v) {
        Some(n) => Value::Number(n),
        None => {
            warn!(value = %v, "measure is not a finite number, storing null");
            Value::Null
        }
    }
}

// ============================================================================
// Filterable fields
// ============================================================================

/// Fields the dashboard can filter on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterField {
    Category,
    Branch,
    Supplier,
}

impl FilterField {
    pub const ALL: [FilterField; 3] = [FilterField::Category, FilterField::Branch, FilterField::Supplier];

    pub fn field(self) -> &'static str {
        match self {
            FilterField::Category => CATEGORY_FIELD,
            FilterField::Branch => BRANCH_FIELD,
            FilterField::Supplier => SUPPLIER_FIELD,
        }
    }

    /// Resolve either the record field name or the plural used by the API
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            CATEGORY_FIELD | "categories" | "category" => Some(FilterField::Category),
            BRANCH_FIELD | "branches" => Some(FilterField::Branch),
            SUPPLIER_FIELD | "suppliers" | "supplier" => Some(FilterField::Supplier),
            _ => None,
        }
    }
}

/// Canonical text form of a scalar value, used for keys and filters.
///
/// Strings are taken as-is, integral numbers lose their fractional part
/// (`100.0` and `"100"` compare equal), null has no text form.
pub fn canonical_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                if f.fract() == 0.0 && f.abs() < 9.0e15 {
                    Some((f as i64).to_string())
                } else {
                    Some(f.to_string())
                }
            }
        }
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

// ============================================================================
// Composite key
// ============================================================================

/// One component of the composite key.
///
/// `Absent` covers both null and missing fields and never equals the empty
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Absent,
    Text(String),
}

impl KeyPart {
    fn of(value: Option<&Value>) -> Self {
        match value.and_then(canonical_text) {
            Some(text) => KeyPart::Text(text),
            None => KeyPart::Absent,
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Absent => write!(f, "<absent>"),
            KeyPart::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// (CategoryShortName, branch, SupplierAlias, ArticleNo)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub category: KeyPart,
    pub branch: KeyPart,
    pub supplier: KeyPart,
    pub article: KeyPart,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.category, self.branch, self.supplier, self.article
        )
    }
}

// ============================================================================
// Record
// ============================================================================

/// One row of business data: field name to JSON value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Composite identity of this record
    pub fn key(&self) -> RecordKey {
        RecordKey {
            category: KeyPart::of(self.get(CATEGORY_FIELD)),
            branch: KeyPart::of(self.get(BRANCH_FIELD)),
            supplier: KeyPart::of(self.get(SUPPLIER_FIELD)),
            article: KeyPart::of(self.get(ARTICLE_FIELD)),
        }
    }

    /// Canonical text of a filterable field, `None` when null or absent
    pub fn filter_text(&self, field: FilterField) -> Option<String> {
        self.get(field.field()).and_then(canonical_text)
    }

    pub fn measure(&self, measure: Measure) -> MeasureValue {
        MeasureValue::read(self.get(measure.field()))
    }

    pub fn set_measure(&mut self, measure: Measure, value: f64) {
        self.0.insert(measure.field().to_string(), number_value(value));
    }

    /// Drop surrogate id, version counter and timestamps
    pub fn strip_lifecycle(&mut self) {
        for field in LIFECYCLE_FIELDS {
            self.0.remove(*field);
        }
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ============================================================================
// Stored record
// ============================================================================

/// A record as held by a store, with its storage-assigned lifecycle fields
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub record: Record,
}

impl StoredRecord {
    /// Wrap a record as a new entity
    pub fn new(record: Record) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            record,
        }
    }
}

/// Serialized flat, the way the dashboard expects documents:
/// `_id`, the record's own fields, then `createdAt` and `updatedAt`.
impl Serialize for StoredRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let own_fields = self
            .record
            .fields()
            .filter(|(k, _)| !LIFECYCLE_FIELDS.contains(&k.as_str()));

        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("_id", &self.id)?;
        for (k, v) in own_fields {
            map.serialize_entry(k, v)?;
        }
        map.serialize_entry("createdAt", &self.created_at)?;
        map.serialize_entry("updatedAt", &self.updated_at)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => Record::from(map),
            _ => panic!("record fixture must be an object"),
        }
    }

    // -------------------------------------------------------------------------
    // NUMERIC COERCION
    // -------------------------------------------------------------------------

    #[test]
    fn test_coerce_number_strings_and_numbers() {
        assert_eq!(coerce_number(Some(&json!("10"))), 10.0);
        assert_eq!(coerce_number(Some(&json!(" 5.5 "))), 5.5);
        assert_eq!(coerce_number(Some(&json!(-3))), -3.0);
        assert_eq!(coerce_number(Some(&json!(2.25))), 2.25);
    }

    #[test]
    fn test_coerce_number_garbage_is_zero() {
        assert_eq!(coerce_number(Some(&json!("abc"))), 0.0);
        assert_eq!(coerce_number(Some(&json!(""))), 0.0);
        assert_eq!(coerce_number(Some(&json!(null))), 0.0);
        assert_eq!(coerce_number(Some(&json!(true))), 0.0);
        assert_eq!(coerce_number(Some(&json!("NaN"))), 0.0);
        assert_eq!(coerce_number(Some(&json!("inf"))), 0.0);
        assert_eq!(coerce_number(None), 0.0);
    }

    #[test]
    fn test_measure_value_distinguishes_missing_from_garbage() {
        assert_eq!(MeasureValue::read(None), MeasureValue::Missing);
        assert_eq!(MeasureValue::read(Some(&json!("  "))), MeasureValue::Missing);
        assert_eq!(MeasureValue::read(Some(&json!("abc"))), MeasureValue::Unparseable);
        assert_eq!(MeasureValue::read(Some(&json!("12x"))), MeasureValue::Parsed(12.0));
        assert_eq!(MeasureValue::read(Some(&json!("12"))), MeasureValue::Parsed(12.0));
    }

    #[test]
    fn test_coerce_number_reads_leading_number() {
        assert_eq!(coerce_number(Some(&json!("12abc"))), 12.0);
        assert_eq!(coerce_number(Some(&json!("7 units"))), 7.0);
        assert_eq!(coerce_number(Some(&json!("1,234.5"))), 1.0);
        assert_eq!(coerce_number(Some(&json!("  -3.5e2kg"))), -350.0);
        assert_eq!(coerce_number(Some(&json!(".5"))), 0.5);
        assert_eq!(coerce_number(Some(&json!("5."))), 5.0);
        assert_eq!(coerce_number(Some(&json!("2e"))), 2.0);
        assert_eq!(coerce_number(Some(&json!("0x1A"))), 0.0);
        assert_eq!(coerce_number(Some(&json!("abc"))), 0.0);
        assert_eq!(coerce_number(Some(&json!("-"))), 0.0);
        assert_eq!(coerce_number(Some(&json!("1e999"))), 0.0);
    }

    #[test]
    fn test_leading_number_len() {
        assert_eq!(leading_number_len("12abc"), 2);
        assert_eq!(leading_number_len("+1.5E+3x"), 7);
        assert_eq!(leading_number_len("1e+"), 1);
        assert_eq!(leading_number_len(".e5"), 0);
        assert_eq!(leading_number_len(""), 0);
    }

    #[test]
    fn test_number_value_integral_becomes_integer() {
        assert_eq!(number_value(15.0), json!(15));
        assert_eq!(number_value(15.5), json!(15.5));
    }

    #[test]
    fn test_number_value_overflow_is_null() {
        assert_eq!(number_value(f64::MAX * 2.0), Value::Null);
        assert_eq!(number_value(f64::NAN), Value::Null);
    }

    // -------------------------------------------------------------------------
    // COMPOSITE KEY
    // -------------------------------------------------------------------------

    #[test]
    fn test_key_null_and_empty_differ() {
        let a = record(json!({"CategoryShortName": null, "branch": "B1", "SupplierAlias": "S1", "ArticleNo": "1"}));
        let b = record(json!({"CategoryShortName": "", "branch": "B1", "SupplierAlias": "S1", "ArticleNo": "1"}));
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_key_null_and_missing_match() {
        let a = record(json!({"CategoryShortName": null, "branch": "B1"}));
        let b = record(json!({"branch": "B1"}));
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().category, KeyPart::Absent);
    }

    #[test]
    fn test_key_numeric_article_matches_text() {
        let a = record(json!({"ArticleNo": 100}));
        let b = record(json!({"ArticleNo": "100"}));
        let c = record(json!({"ArticleNo": 100.0}));
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key(), c.key());
    }

    #[test]
    fn test_key_pipe_in_values_does_not_collide() {
        let a = record(json!({"CategoryShortName": "A|||B", "branch": "C"}));
        let b = record(json!({"CategoryShortName": "A", "branch": "B|||C"}));
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_key_display() {
        let a = record(json!({"CategoryShortName": "A", "ArticleNo": 7}));
        assert_eq!(a.key().to_string(), "(\"A\", <absent>, <absent>, \"7\")");
    }

    // -------------------------------------------------------------------------
    // ACCESSORS
    // -------------------------------------------------------------------------

    #[test]
    fn test_filter_text() {
        let r = record(json!({"branch": 12, "SupplierAlias": null}));
        assert_eq!(r.filter_text(FilterField::Branch), Some("12".to_string()));
        assert_eq!(r.filter_text(FilterField::Supplier), None);
        assert_eq!(r.filter_text(FilterField::Category), None);
    }

    #[test]
    fn test_strip_lifecycle_keeps_business_fields() {
        let mut r = record(json!({"_id": "x", "__v": 0, "createdAt": "t", "updatedAt": "t", "Description": "Milk"}));
        r.strip_lifecycle();
        assert_eq!(r, record(json!({"Description": "Milk"})));
    }

    #[test]
    fn test_filter_field_parse() {
        assert_eq!(FilterField::parse("categories"), Some(FilterField::Category));
        assert_eq!(FilterField::parse("branch"), Some(FilterField::Branch));
        assert_eq!(FilterField::parse("SupplierAlias"), Some(FilterField::Supplier));
        assert_eq!(FilterField::parse("ArticleNo"), None);
    }

    #[test]
    fn test_stored_record_serializes_flat() {
        let mut r = record(json!({"branch": "B1", "_id": "stale"}));
        r.insert("NetAmount", 3);
        let stored = StoredRecord::new(r);
        let doc = serde_json::to_value(&stored).unwrap();
        assert_eq!(doc["_id"], json!(stored.id.to_string()));
        assert_eq!(doc["branch"], json!("B1"));
        assert_eq!(doc["NetAmount"], json!(3));
        assert!(doc.get("createdAt").is_some());
        assert!(doc.get("updatedAt").is_some());
    }
}
