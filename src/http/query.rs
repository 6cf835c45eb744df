//! Query arguments.
//!
//! [`Query`] is an ordered multimap of decoded key/value pairs. Parsing a raw
//! query string collapses repeated keys: the last value wins and takes the
//! slot of the first occurrence. Encoding is `application/x-www-form-urlencoded`,
//! so a parsed query always re-encodes the same way.

use url::form_urlencoded::byte_serialize;

/// Form-encodes one query component: `+` for spaces, `%XX` for everything
/// outside `A-Za-z0-9*-._`.
pub fn encode_component(s: &str) -> String {
    byte_serialize(s.as_bytes()).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a raw query string (without the leading `?`).
    pub fn parse(raw: &str) -> Self {
        let mut query = Query::new();
        query.merge_raw(raw);
        query
    }

    /// Decodes `raw` and inserts each pair with last-wins semantics.
    pub fn merge_raw(&mut self, raw: &str) {
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            if key.is_empty() {
                continue;
            }
            self.insert(key.into_owned(), value.into_owned());
        }
    }

    /// Inserts or replaces `key`, keeping the slot of the first occurrence.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    /// Adds a pair without collapsing an existing key.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Inserts every pair of `other` with last-wins semantics.
    pub fn extend(&mut self, other: &Query) {
        for (k, v) in &other.pairs {
            self.insert(k.clone(), v.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Encodes as `k=v&k2=v2`. Keys with empty values are written bare.
    pub fn encode(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    encode_component(k)
                } else {
                    format!("{}={}", encode_component(k), encode_component(v))
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Query {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut query = Query::new();
        for (k, v) in iter {
            query.insert(k, v);
        }
        query
    }
}
