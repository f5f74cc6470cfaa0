// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed query-parameter map.
//!
//! Parsed once per request; parameter order is preserved because the
//! override merge is positional: request parameters replace same-named
//! configured parameters *in place*, unknown request parameters append.
//! That merge is how time-shift values reach RTSP upstreams through
//! configured service URLs.

/// Ordered name/value multimap over a query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMap {
    params: Vec<(String, String)>,
}

impl QueryMap {
    /// Parse `a=1&b=2`. Empty pairs are skipped; a pair without `=` maps
    /// to an empty value. Values stay raw (the gateway forwards them
    /// byte-for-byte upstream).
    pub fn parse(qs: &str) -> Self {
        let mut params = Vec::new();
        for pair in qs.split('&') {
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((k, v)) => params.push((k.to_string(), v.to_string())),
                None => params.push((pair.to_string(), String::new())),
            }
        }
        Self { params }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// First value under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Remove every pair under `name`, returning the first value.
    /// Used to strip gateway-internal parameters before anything is
    /// forwarded upstream.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let first = self
            .params
            .iter()
            .position(|(k, _)| k == name)
            .map(|i| self.params[i].1.clone());
        self.params.retain(|(k, _)| k != name);
        first
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Override merge: `self` is the configured URL's query, `request`
    /// the client's. Same-named configured params are replaced in their
    /// original positions; request params with no configured counterpart
    /// append in request order.
    pub fn merge_override(&self, request: &QueryMap) -> QueryMap {
        let mut merged = self.clone();
        for (name, value) in request.iter() {
            let mut replaced = false;
            for slot in merged.params.iter_mut().filter(|(k, _)| k == name) {
                slot.1 = value.to_string();
                replaced = true;
            }
            if !replaced {
                merged.params.push((name.to_string(), value.to_string()));
            }
        }
        merged
    }

    /// Re-encode as a query string (no leading `?`).
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (i, (k, v)) in self.params.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(k);
            if !v.is_empty() {
                out.push('=');
                out.push_str(v);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_lookup() {
        let q = QueryMap::parse("fcc=10.0.0.1:8080&fcc-type=huawei&flag");
        assert_eq!(q.len(), 3);
        assert_eq!(q.get("fcc"), Some("10.0.0.1:8080"));
        assert_eq!(q.get("fcc-type"), Some("huawei"));
        assert_eq!(q.get("flag"), Some(""));
        assert_eq!(q.get("missing"), None);
    }

    #[test]
    fn empty_query() {
        let q = QueryMap::parse("");
        assert!(q.is_empty());
        assert_eq!(q.encode(), "");
    }

    #[test]
    fn override_replaces_in_position() {
        let configured = QueryMap::parse("a=1&playseek=0&b=2");
        let request = QueryMap::parse("playseek=20250101100000-20250101110000");
        let merged = configured.merge_override(&request);
        assert_eq!(
            merged.encode(),
            "a=1&playseek=20250101100000-20250101110000&b=2"
        );
    }

    #[test]
    fn override_appends_unknown() {
        let configured = QueryMap::parse("a=1");
        let request = QueryMap::parse("tvdr=123&a=9");
        let merged = configured.merge_override(&request);
        assert_eq!(merged.encode(), "a=9&tvdr=123");
    }

    #[test]
    fn remove_strips_all_occurrences() {
        let mut q = QueryMap::parse("r2h-token=s3cret&x=1&r2h-token=other");
        assert_eq!(q.remove("r2h-token").as_deref(), Some("s3cret"));
        assert_eq!(q.encode(), "x=1");
        assert_eq!(q.remove("r2h-token"), None);
    }

    #[test]
    fn encode_round_trip() {
        let raw = "a=1&b&c=three";
        assert_eq!(QueryMap::parse(raw).encode(), raw);
    }
}
