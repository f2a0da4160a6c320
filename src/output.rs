//! Structured output records keyed by named, typed fields.
//!
//! A `FieldSet` is the per-response record a probe module populates: an
//! ordered list of named values, where a value may itself be a list of
//! sub-fieldsets (DNS answer sections). Modules also publish a static
//! `FieldDef` table describing their columns so output sinks can build a
//! schema up front.
//!
//! JSON serialization goes through serde; binary values encode as base64.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

/// The declared type of an output column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Int,
    Bool,
    Binary,
    Repeated,
}

/// Schema entry: column name, type, human description.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub kind: FieldKind,
    pub desc: &'static str,
}

/// Whether a module's output columns are fixed or depend on its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    Static,
    Dynamic,
}

/// One field value. `Null` marks a column that does not apply to this
/// response but must keep its slot in the record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldVal {
    Null,
    Str(String),
    Uint(u64),
    Bool(bool),
    Binary(Vec<u8>),
    Repeated(Vec<FieldSet>),
}

/// Ordered record of named field values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSet {
    fields: Vec<(&'static str, FieldVal)>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_string(&mut self, name: &'static str, val: impl Into<String>) {
        self.fields.push((name, FieldVal::Str(val.into())));
    }

    pub fn add_uint64(&mut self, name: &'static str, val: u64) {
        self.fields.push((name, FieldVal::Uint(val)));
    }

    pub fn add_bool(&mut self, name: &'static str, val: bool) {
        self.fields.push((name, FieldVal::Bool(val)));
    }

    pub fn add_binary(&mut self, name: &'static str, val: impl Into<Vec<u8>>) {
        self.fields.push((name, FieldVal::Binary(val.into())));
    }

    pub fn add_null(&mut self, name: &'static str) {
        self.fields.push((name, FieldVal::Null));
    }

    pub fn add_repeated(&mut self, name: &'static str, val: Vec<FieldSet>) {
        self.fields.push((name, FieldVal::Repeated(val)));
    }

    /// Replace the value of an existing string field; appends if absent.
    pub fn modify_string(&mut self, name: &'static str, val: impl Into<String>) {
        let val = FieldVal::Str(val.into());
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = val,
            None => self.fields.push((name, val)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldVal> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FieldVal)> {
        self.fields.iter().map(|(n, v)| (*n, v))
    }
}

impl Serialize for FieldVal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldVal::Null => serializer.serialize_none(),
            FieldVal::Str(s) => serializer.serialize_str(s),
            FieldVal::Uint(n) => serializer.serialize_u64(*n),
            FieldVal::Bool(b) => serializer.serialize_bool(*b),
            FieldVal::Binary(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
            FieldVal::Repeated(sets) => {
                let mut seq = serializer.serialize_seq(Some(sets.len()))?;
                for fs in sets {
                    seq.serialize_element(fs)?;
                }
                seq.end()
            }
        }
    }
}

impl Serialize for FieldSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, val) in &self.fields {
            map.serialize_entry(name, val)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_keep_insertion_order() {
        let mut fs = FieldSet::new();
        fs.add_string("classification", "dns");
        fs.add_bool("success", true);
        fs.add_uint64("sport", 53);
        let names: Vec<_> = fs.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["classification", "success", "sport"]);
    }

    #[test]
    fn test_modify_string_replaces_in_place() {
        let mut fs = FieldSet::new();
        fs.add_string("saddr", "203.0.113.9");
        fs.add_uint64("ttl", 64);
        fs.modify_string("saddr", "1.2.3.4");
        assert_eq!(fs.get("saddr"), Some(&FieldVal::Str("1.2.3.4".into())));
        assert_eq!(fs.len(), 2, "modify must not append a duplicate");
    }

    #[test]
    fn test_json_shape() {
        let mut inner = FieldSet::new();
        inner.add_string("name", "example.com");
        inner.add_uint64("qtype", 1);

        let mut fs = FieldSet::new();
        fs.add_string("classification", "dns");
        fs.add_bool("success", true);
        fs.add_null("icmp_type");
        fs.add_repeated("dns_questions", vec![inner]);

        let json = serde_json::to_value(&fs).unwrap();
        assert_eq!(json["classification"], "dns");
        assert_eq!(json["success"], true);
        assert!(json["icmp_type"].is_null());
        assert_eq!(json["dns_questions"][0]["name"], "example.com");
        assert_eq!(json["dns_questions"][0]["qtype"], 1);
    }

    #[test]
    fn test_binary_serializes_as_base64() {
        let mut fs = FieldSet::new();
        fs.add_binary("raw_data", vec![0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_value(&fs).unwrap();
        assert_eq!(json["raw_data"], "3q2+7w==");
    }

    #[test]
    fn test_get_missing_field_is_none() {
        let fs = FieldSet::new();
        assert!(fs.get("nope").is_none());
        assert!(fs.is_empty());
    }
}
