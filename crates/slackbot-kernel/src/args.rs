use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::form_urlencoded;

/// Flat string arguments carried between modal steps, encoded as a
/// `key=value&...` form string so they fit in storage values and Slack fields.
#[derive(Debug, Clone, Default)]
pub struct Args {
    values: IndexMap<String, String>,
    raw: Option<String>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a form string. Never fails: bad percent escapes are kept
    /// literally and invalid UTF-8 is replaced.
    pub fn parse(raw: &str) -> Self {
        Self {
            values: decode(raw),
            raw: Some(raw.to_string()),
        }
    }

    /// Re-parses `raw` in place; `None` clears every value.
    pub fn set_raw(&mut self, raw: Option<&str>) {
        self.values = raw.map(decode).unwrap_or_default();
        self.raw = raw.map(|v| v.to_string());
    }

    /// The last raw string handed to [`Args::parse`] or [`Args::set_raw`].
    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns a copy with `extra` laid over the current values.
    pub fn merge<I, K, V>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut values = self.values.clone();
        for (key, value) in extra {
            values.insert(key.into(), value.into());
        }
        Self { values, raw: None }
    }

    /// Returns a copy without `keys`.
    pub fn except<I, K>(&self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut values = self.values.clone();
        for key in keys {
            values.shift_remove(key.as_ref());
        }
        Self { values, raw: None }
    }

    pub fn encode(&self) -> String {
        if self.values.is_empty() {
            return String::new();
        }
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.values.iter())
            .finish()
    }
}

fn decode(raw: &str) -> IndexMap<String, String> {
    form_urlencoded::parse(raw.as_bytes())
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

impl PartialEq for Args {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Eq for Args {}

impl fmt::Display for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Args {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Args {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self::new().merge(iter)
    }
}

impl Serialize for Args {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Args {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.map(|v| Self::parse(&v)).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reads_pairs_in_order() {
        let args = Args::parse("foo=bar&baz=qux");
        assert_eq!(args.get("foo"), Some("bar"));
        assert_eq!(args.get("baz"), Some("qux"));
        assert_eq!(args.get("missing"), None);
        assert_eq!(args.to_string(), "foo=bar&baz=qux");
    }

    #[test]
    fn empty_input_and_empty_map_are_identities() {
        assert!(Args::parse("").is_empty());
        assert_eq!(Args::new().to_string(), "");
        let mut args = Args::parse("a=1");
        args.set_raw(None);
        assert!(args.is_empty());
    }

    #[test]
    fn decodes_percent_escapes() {
        let args = Args::parse("foo=hello%20world&name=J%C3%BCrgen");
        assert_eq!(args.get("foo"), Some("hello world"));
        assert_eq!(args.get("name"), Some("Jürgen"));
    }

    #[test]
    fn malformed_input_decodes_best_effort() {
        let args = Args::parse("bad=%zz&ok=1&&=orphan&flag");
        assert_eq!(args.get("bad"), Some("%zz"));
        assert_eq!(args.get("ok"), Some("1"));
        assert_eq!(args.get("flag"), Some(""));
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn round_trips_values_with_reserved_characters() {
        let args: Args = [("q", "a b/c?"), ("page", "2"), ("empty", "")]
            .into_iter()
            .collect();
        let decoded = Args::parse(&args.to_string());
        assert_eq!(decoded, args);
    }

    #[test]
    fn merge_overlays_without_touching_receiver() {
        let args = Args::parse("foo=bar&baz=qux");
        let merged = args.merge([("foo", "baz"), ("page", "3")]);
        assert_eq!(merged.to_string(), "foo=baz&baz=qux&page=3");
        assert_eq!(args.get("foo"), Some("bar"));
        assert_ne!(merged, args);
    }

    #[test]
    fn except_drops_keys_without_touching_receiver() {
        let args = Args::parse("foo=bar&baz=qux&quux=corge");
        let trimmed = args.except(["foo", "baz"]);
        assert_eq!(trimmed.to_string(), "quux=corge");
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn get_parsed_ignores_non_numbers() {
        let args = Args::parse("page=3&per_page=abc");
        assert_eq!(args.get_parsed::<usize>("page"), Some(3));
        assert_eq!(args.get_parsed::<usize>("per_page"), None);
    }

    #[test]
    fn serializes_as_encoded_string() {
        let args = Args::parse("foo=bar");
        assert_eq!(serde_json::to_value(&args).unwrap(), "foo=bar");
        let back: Args = serde_json::from_value(serde_json::Value::Null).unwrap();
        assert!(back.is_empty());
    }
}
