//! Request keys: canonical fingerprints of data requests.
//!
//! A [`RequestKey`] is an immutable, order-independent mapping from field names
//! to string values. Its canonical serialized form is the sorted concatenation
//! of `KEY=VALUE;` pairs with `\`, `=` and `;` backslash-escaped, and it is the
//! only thing equality and hashing look at.
//!
//! Keys are assembled with a [`RequestBuilder`] and frozen with
//! [`RequestBuilder::build`]. Once a key has been handed to a source it is never
//! mutated; derived requests are built from [`RequestKey::to_builder`].

use crate::error::RequestKeyError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Separator between a key and its value.
const ASSIGN: char = '=';

/// Terminator after every value.
const TERMINATOR: char = ';';

/// Escape character for the three reserved characters.
const ESCAPE: char = '\\';

/// Separator used by list-valued fields (vectors, member sets, ranges).
const LIST_SEPARATOR: char = '/';

/// Number of digest bytes shown in log output.
const DIGEST_BYTES: usize = 8;

// ============================================================================
// REQUEST KEY
// ============================================================================

/// Immutable canonical request fingerprint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestKey {
    fields: BTreeMap<String, String>,
    serialized: String,
}

impl RequestKey {
    /// The empty request.
    pub fn empty() -> Self {
        Self::default()
    }

    fn from_fields(fields: BTreeMap<String, String>) -> Self {
        let serialized = serialize_fields(&fields);
        Self { fields, serialized }
    }

    /// Parse a canonical serialized form.
    ///
    /// Pairs need not be sorted; the resulting key is canonical regardless.
    /// Fails with [`RequestKeyError::Malformed`] on a missing `=`, a missing
    /// terminating `;`, a dangling escape, or a repeated key.
    pub fn parse(s: &str) -> Result<Self, RequestKeyError> {
        let mut fields = BTreeMap::new();
        let mut key = String::new();
        let mut value = String::new();
        let mut in_value = false;
        let mut escaped = false;

        for c in s.chars() {
            let target = if in_value { &mut value } else { &mut key };
            if escaped {
                target.push(c);
                escaped = false;
                continue;
            }
            match c {
                ESCAPE => escaped = true,
                ASSIGN if !in_value => in_value = true,
                ASSIGN => {
                    return Err(RequestKeyError::Malformed {
                        field: key,
                        reason: "unescaped '=' inside value".to_string(),
                    })
                }
                TERMINATOR if in_value => {
                    let k = std::mem::take(&mut key);
                    let v = std::mem::take(&mut value);
                    if fields.contains_key(&k) {
                        return Err(RequestKeyError::Malformed {
                            field: k,
                            reason: "key occurs more than once".to_string(),
                        });
                    }
                    fields.insert(k, v);
                    in_value = false;
                }
                TERMINATOR => {
                    return Err(RequestKeyError::Malformed {
                        field: key,
                        reason: "pair has no '=' separator".to_string(),
                    })
                }
                other => target.push(other),
            }
        }

        if escaped {
            return Err(RequestKeyError::Malformed {
                field: key,
                reason: "dangling escape character".to_string(),
            });
        }
        if in_value || !key.is_empty() {
            return Err(RequestKeyError::Malformed {
                field: key,
                reason: "last pair is not terminated by ';'".to_string(),
            });
        }

        Ok(Self::from_fields(fields))
    }

    /// Canonical serialized form.
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    /// Start a new builder holding a copy of this key's fields.
    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            fields: self.fields.clone(),
        }
    }

    /// Short hex SHA-256 of the canonical form, for log output.
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.serialized.as_bytes());
        hex::encode(&hash[..DIGEST_BYTES])
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over `(key, value)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn value(&self, key: &str) -> Result<&str, RequestKeyError> {
        lookup(&self.fields, key)
    }

    pub fn int_value(&self, key: &str) -> Result<i64, RequestKeyError> {
        parse_int(&self.fields, key)
    }

    pub fn float_value(&self, key: &str) -> Result<f64, RequestKeyError> {
        parse_float(&self.fields, key)
    }

    pub fn time_value(&self, key: &str) -> Result<DateTime<Utc>, RequestKeyError> {
        parse_time(&self.fields, key)
    }

    pub fn uint_set_value(&self, key: &str) -> Result<BTreeSet<u32>, RequestKeyError> {
        parse_uint_set(&self.fields, key)
    }

    pub fn vec3_value(&self, key: &str) -> Result<[f32; 3], RequestKeyError> {
        parse_vec3(&self.fields, key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// True if every listed key is present.
    pub fn contains_all<I, S>(&self, keys: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter().all(|k| self.fields.contains_key(k.as_ref()))
    }

    /// Listed keys that are absent, in the order given.
    pub fn missing<I, S>(&self, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter()
            .filter(|k| !self.fields.contains_key(k.as_ref()))
            .map(|k| k.as_ref().to_string())
            .collect()
    }

    /// Fields whose key starts with `prefix`, with the prefix stripped.
    pub fn sub_request(&self, prefix: &str) -> RequestKey {
        Self::from_fields(strip_prefixed(&self.fields, prefix))
    }

    /// This key reduced to the listed fields.
    pub fn reduced_to<I, S>(&self, keys: I) -> RequestKey
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = self.to_builder();
        builder.retain_only(keys);
        builder.build()
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.serialized == other.serialized
    }
}

impl Eq for RequestKey {}

impl Hash for RequestKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serialized.hash(state);
    }
}

impl PartialOrd for RequestKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RequestKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.serialized.cmp(&other.serialized)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized)
    }
}

impl FromStr for RequestKey {
    type Err = RequestKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RequestKey {
    type Error = RequestKeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<RequestKey> for String {
    fn from(key: RequestKey) -> Self {
        key.serialized
    }
}

impl From<RequestBuilder> for RequestKey {
    fn from(builder: RequestBuilder) -> Self {
        RequestKey::from_fields(builder.fields)
    }
}

// ============================================================================
// REQUEST BUILDER
// ============================================================================

/// Mutable field set used to assemble a [`RequestKey`].
///
/// Insertion order never matters; the canonical form is derived from the
/// final field set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestBuilder {
    fields: BTreeMap<String, String>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or overwrite a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Consuming variant of [`insert`](Self::insert) for chained construction.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert_int(&mut self, key: impl Into<String>, value: i64) -> &mut Self {
        self.insert(key, value.to_string())
    }

    pub fn insert_float(&mut self, key: impl Into<String>, value: f64) -> &mut Self {
        self.insert(key, value.to_string())
    }

    /// Insert a UTC timestamp as ISO-8601 (`2012-10-17T12:00:00Z`).
    pub fn insert_time(&mut self, key: impl Into<String>, value: DateTime<Utc>) -> &mut Self {
        self.insert(key, value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    /// Insert a 3-vector as `x/y/z`.
    pub fn insert_vec3(&mut self, key: impl Into<String>, value: [f32; 3]) -> &mut Self {
        self.insert(key, format!("{}/{}/{}", value[0], value[1], value[2]))
    }

    /// Insert an unsigned set as sorted, deduplicated `a/b/c`.
    pub fn insert_uint_set<I>(&mut self, key: impl Into<String>, values: I) -> &mut Self
    where
        I: IntoIterator<Item = u32>,
    {
        let set: BTreeSet<u32> = values.into_iter().collect();
        let joined = set
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join("/");
        self.insert(key, joined)
    }

    /// Remove a field; returns whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        self.fields.remove(key).is_some()
    }

    pub fn remove_all<I, S>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for key in keys {
            self.fields.remove(key.as_ref());
        }
        self
    }

    /// Keep only the listed fields.
    pub fn retain_only<I, S>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keep: BTreeSet<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        self.fields.retain(|k, _| keep.contains(k));
        self
    }

    pub fn value(&self, key: &str) -> Result<&str, RequestKeyError> {
        lookup(&self.fields, key)
    }

    pub fn int_value(&self, key: &str) -> Result<i64, RequestKeyError> {
        parse_int(&self.fields, key)
    }

    pub fn float_value(&self, key: &str) -> Result<f64, RequestKeyError> {
        parse_float(&self.fields, key)
    }

    pub fn time_value(&self, key: &str) -> Result<DateTime<Utc>, RequestKeyError> {
        parse_time(&self.fields, key)
    }

    pub fn uint_set_value(&self, key: &str) -> Result<BTreeSet<u32>, RequestKeyError> {
        parse_uint_set(&self.fields, key)
    }

    pub fn vec3_value(&self, key: &str) -> Result<[f32; 3], RequestKeyError> {
        parse_vec3(&self.fields, key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn contains_all<I, S>(&self, keys: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter().all(|k| self.fields.contains_key(k.as_ref()))
    }

    pub fn missing<I, S>(&self, keys: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter()
            .filter(|k| !self.fields.contains_key(k.as_ref()))
            .map(|k| k.as_ref().to_string())
            .collect()
    }

    /// Merge another request into this one; the other request's values win.
    pub fn unite(&mut self, other: &RequestKey) -> &mut Self {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
        self
    }

    /// Prepend `prefix` to every key.
    pub fn add_key_prefix(&mut self, prefix: &str) -> &mut Self {
        if prefix.is_empty() {
            return self;
        }
        let fields = std::mem::take(&mut self.fields);
        self.fields = fields
            .into_iter()
            .map(|(k, v)| (format!("{}{}", prefix, k), v))
            .collect();
        self
    }

    /// Strip `prefix` from every key that carries it. Other keys are kept.
    pub fn remove_key_prefix(&mut self, prefix: &str) -> &mut Self {
        if prefix.is_empty() {
            return self;
        }
        let fields = std::mem::take(&mut self.fields);
        for (k, v) in fields {
            let key = match k.strip_prefix(prefix) {
                Some(stripped) => stripped.to_string(),
                None => k,
            };
            self.fields.insert(key, v);
        }
        self
    }

    /// Fields whose key starts with `prefix`, with the prefix stripped.
    pub fn sub_request(&self, prefix: &str) -> RequestBuilder {
        RequestBuilder {
            fields: strip_prefixed(&self.fields, prefix),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Canonical serialized form of the current field set.
    pub fn serialize(&self) -> String {
        serialize_fields(&self.fields)
    }

    /// Freeze the current field set into an immutable key.
    pub fn build(&self) -> RequestKey {
        RequestKey::from_fields(self.fields.clone())
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        if matches!(c, ESCAPE | ASSIGN | TERMINATOR) {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

fn serialize_fields(fields: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in fields {
        escape_into(&mut out, k);
        out.push(ASSIGN);
        escape_into(&mut out, v);
        out.push(TERMINATOR);
    }
    out
}

fn strip_prefixed(fields: &BTreeMap<String, String>, prefix: &str) -> BTreeMap<String, String> {
    fields
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(prefix).map(|s| (s.to_string(), v.clone())))
        .collect()
}

fn lookup<'a>(fields: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str, RequestKeyError> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| RequestKeyError::NotFound {
            key: key.to_string(),
        })
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> RequestKeyError {
    RequestKeyError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_int(fields: &BTreeMap<String, String>, key: &str) -> Result<i64, RequestKeyError> {
    let raw = lookup(fields, key)?;
    raw.trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| invalid(key, raw, e.to_string()))
}

fn parse_float(fields: &BTreeMap<String, String>, key: &str) -> Result<f64, RequestKeyError> {
    let raw = lookup(fields, key)?;
    raw.trim()
        .parse()
        .map_err(|e: std::num::ParseFloatError| invalid(key, raw, e.to_string()))
}

fn parse_time(
    fields: &BTreeMap<String, String>,
    key: &str,
) -> Result<DateTime<Utc>, RequestKeyError> {
    let raw = lookup(fields, key)?;
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| invalid(key, raw, e.to_string()))
}

fn parse_uint_set(
    fields: &BTreeMap<String, String>,
    key: &str,
) -> Result<BTreeSet<u32>, RequestKeyError> {
    let raw = lookup(fields, key)?;
    if raw.is_empty() {
        return Ok(BTreeSet::new());
    }
    raw.split(LIST_SEPARATOR)
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .map_err(|e| invalid(key, raw, e.to_string()))
        })
        .collect()
}

fn parse_vec3(fields: &BTreeMap<String, String>, key: &str) -> Result<[f32; 3], RequestKeyError> {
    let raw = lookup(fields, key)?;
    let parts: Vec<&str> = raw.split(LIST_SEPARATOR).collect();
    if parts.len() != 3 {
        return Err(invalid(key, raw, "expected three components x/y/z"));
    }
    let mut out = [0f32; 3];
    for (slot, part) in out.iter_mut().zip(parts) {
        *slot = part
            .trim()
            .parse()
            .map_err(|e: std::num::ParseFloatError| invalid(key, raw, e.to_string()))?;
    }
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn sample() -> RequestKey {
        RequestBuilder::new()
            .with("VARIABLE", "T")
            .with("MEMBER", "0")
            .with("LEVELTYPE", "PRESSURE_LEVELS_3D")
            .build()
    }

    #[test]
    fn test_serialize_sorts_by_key() {
        assert_eq!(
            sample().as_str(),
            "LEVELTYPE=PRESSURE_LEVELS_3D;MEMBER=0;VARIABLE=T;"
        );
    }

    #[test]
    fn test_insert_overwrites() {
        let mut b = RequestBuilder::new();
        b.insert("MEMBER", "0").insert("MEMBER", "3");
        assert_eq!(b.value("MEMBER").unwrap(), "3");
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_value_not_found() {
        let err = sample().value("VALID_TIME").unwrap_err();
        assert_eq!(
            err,
            RequestKeyError::NotFound {
                key: "VALID_TIME".to_string()
            }
        );
    }

    #[test]
    fn test_reserved_characters_are_escaped() {
        let key = RequestBuilder::new().with("A=B", "x;y\\z").build();
        assert_eq!(key.as_str(), "A\\=B=x\\;y\\\\z;");
        let parsed = RequestKey::parse(key.as_str()).unwrap();
        assert_eq!(parsed.value("A=B").unwrap(), "x;y\\z");
    }

    #[test]
    fn test_equality_and_hash_use_serialized_form() {
        let a = RequestBuilder::new().with("X", "1").with("Y", "2").build();
        let b = RequestBuilder::new().with("Y", "2").with("X", "1").build();
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_parse_accepts_unsorted_input() {
        let key = RequestKey::parse("B=2;A=1;").unwrap();
        assert_eq!(key.as_str(), "A=1;B=2;");
    }

    #[test]
    fn test_parse_empty_string_is_empty_key() {
        let key = RequestKey::parse("").unwrap();
        assert!(key.is_empty());
        assert_eq!(key, RequestKey::empty());
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        assert!(matches!(
            RequestKey::parse("A=1"),
            Err(RequestKeyError::Malformed { .. })
        ));
        assert!(matches!(
            RequestKey::parse("A;"),
            Err(RequestKeyError::Malformed { .. })
        ));
        assert!(matches!(
            RequestKey::parse("A=1=2;"),
            Err(RequestKeyError::Malformed { .. })
        ));
        assert!(matches!(
            RequestKey::parse("A=1;A=2;"),
            Err(RequestKeyError::Malformed { .. })
        ));
        assert!(matches!(
            RequestKey::parse("A=1\\"),
            Err(RequestKeyError::Malformed { .. })
        ));
    }

    #[test]
    fn test_remove_and_retain_only() {
        let mut b = sample().to_builder();
        assert!(b.remove("MEMBER"));
        assert!(!b.remove("MEMBER"));
        b.insert("INIT_TIME", "x").insert("VALID_TIME", "y");
        b.retain_only(["VARIABLE", "INIT_TIME", "NOT_THERE"]);
        assert_eq!(b.serialize(), "INIT_TIME=x;VARIABLE=T;");
        b.remove_all(["INIT_TIME"]);
        assert_eq!(b.serialize(), "VARIABLE=T;");
    }

    #[test]
    fn test_contains_all_and_missing() {
        let key = sample();
        assert!(key.contains_all(["VARIABLE", "MEMBER"]));
        assert!(!key.contains_all(["VARIABLE", "INIT_TIME"]));
        assert_eq!(
            key.missing(["INIT_TIME", "MEMBER", "VALID_TIME"]),
            vec!["INIT_TIME".to_string(), "VALID_TIME".to_string()]
        );
    }

    #[test]
    fn test_unite_other_wins() {
        let mut b = RequestBuilder::new().with("A", "1").with("B", "1");
        let other = RequestBuilder::new().with("B", "2").with("C", "3").build();
        b.unite(&other);
        assert_eq!(b.serialize(), "A=1;B=2;C=3;");
    }

    #[test]
    fn test_prefix_operations() {
        let mut b = RequestBuilder::new().with("VARIABLE", "T").with("MEMBERS", "0/1");
        b.add_key_prefix("VARFILTER_");
        assert_eq!(b.serialize(), "VARFILTER_MEMBERS=0/1;VARFILTER_VARIABLE=T;");

        b.insert("OTHER", "x");
        let sub = b.sub_request("VARFILTER_");
        assert_eq!(sub.serialize(), "MEMBERS=0/1;VARIABLE=T;");

        b.remove_key_prefix("VARFILTER_");
        assert_eq!(b.serialize(), "MEMBERS=0/1;OTHER=x;VARIABLE=T;");
    }

    #[test]
    fn test_key_sub_request_and_reduction() {
        let key = RequestBuilder::new()
            .with("LINES_VARIABLE", "T")
            .with("GEOLENFILTER_VALUE", "500")
            .build();
        assert_eq!(key.sub_request("LINES_").as_str(), "VARIABLE=T;");
        assert_eq!(
            key.reduced_to(["GEOLENFILTER_VALUE"]).as_str(),
            "GEOLENFILTER_VALUE=500;"
        );
    }

    #[test]
    fn test_typed_values() {
        let t = Utc.with_ymd_and_hms(2012, 10, 17, 12, 0, 0).unwrap();
        let mut b = RequestBuilder::new();
        b.insert_int("N", -4)
            .insert_float("F", 2.5)
            .insert_time("INIT_TIME", t)
            .insert_vec3("POS", [1.0, 2.5, -3.0])
            .insert_uint_set("MEMBERS", [3, 1, 2, 3]);

        assert_eq!(b.value("INIT_TIME").unwrap(), "2012-10-17T12:00:00Z");
        assert_eq!(b.value("MEMBERS").unwrap(), "1/2/3");
        assert_eq!(b.value("POS").unwrap(), "1/2.5/-3");

        let key = b.build();
        assert_eq!(key.int_value("N").unwrap(), -4);
        assert_eq!(key.float_value("F").unwrap(), 2.5);
        assert_eq!(key.time_value("INIT_TIME").unwrap(), t);
        assert_eq!(key.vec3_value("POS").unwrap(), [1.0, 2.5, -3.0]);
        assert_eq!(
            key.uint_set_value("MEMBERS").unwrap(),
            BTreeSet::from([1, 2, 3])
        );
    }

    #[test]
    fn test_typed_value_invalid() {
        let key = RequestBuilder::new()
            .with("N", "abc")
            .with("POS", "1/2")
            .build();
        assert!(matches!(
            key.int_value("N"),
            Err(RequestKeyError::InvalidValue { .. })
        ));
        assert!(matches!(
            key.vec3_value("POS"),
            Err(RequestKeyError::InvalidValue { .. })
        ));
        assert!(matches!(
            key.int_value("MISSING"),
            Err(RequestKeyError::NotFound { .. })
        ));
    }

    #[test]
    fn test_empty_uint_set() {
        let mut b = RequestBuilder::new();
        b.insert_uint_set("MEMBERS", std::iter::empty());
        assert!(b.uint_set_value("MEMBERS").unwrap().is_empty());
    }

    #[test]
    fn test_digest_is_short_and_stable() {
        let a = sample();
        let b = sample();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), DIGEST_BYTES * 2);
        assert_ne!(a.digest(), RequestKey::empty().digest());
    }

    #[test]
    fn test_serde_as_string() {
        let key = sample();
        let json = toml::Value::try_from(&key).unwrap();
        assert_eq!(json.as_str(), Some(key.as_str()));
    }
}
