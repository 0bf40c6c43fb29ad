//! # Key Codec
//!
//! Entry keys are UTF-8 JSON arrays of four elements:
//!
//! ```text
//! [metric_name, sample_name, [label_name, ...], [label_value, ...]]
//! ```
//!
//! The storage layer never looks inside a key; it hashes and compares the
//! raw bytes. That makes canonicalization a writer-side duty: labels are
//! sorted by name before encoding, so the same logical series produces the
//! same key bytes no matter what order the caller supplied labels in.
//! Decoding happens only during aggregation.
//!
//! Label values may be JSON strings, numbers, booleans, or null (an empty
//! value). They are kept as raw JSON slices during decode and normalized to
//! display text only when samples are built.

use eyre::{ensure, eyre, Result};
use serde::Deserialize;
use serde_json::value::RawValue;
use smallvec::SmallVec;

/// Encode a canonical key for `sample_name` of `metric_name` with the given
/// label pairs. Labels are sorted by name; the input order is irrelevant.
pub fn encode_key(metric_name: &str, sample_name: &str, labels: &[(&str, &str)]) -> Vec<u8> {
    let mut sorted: SmallVec<[(&str, &str); 4]> = SmallVec::from_slice(labels);
    sorted.sort_by_key(|(name, _)| *name);

    let names: SmallVec<[&str; 4]> = sorted.iter().map(|(name, _)| *name).collect();
    let values: SmallVec<[&str; 4]> = sorted.iter().map(|(_, value)| *value).collect();

    // UNWRAP: strings and arrays of strings always serialize.
    serde_json::to_vec(&(metric_name, sample_name, names, values)).unwrap()
}

/// A key decoded for aggregation. Label values stay borrowed raw JSON until
/// rendered.
#[derive(Debug, Deserialize)]
pub struct DecodedKey<'a>(
    String,
    String,
    SmallVec<[String; 4]>,
    #[serde(borrow)] SmallVec<[&'a RawValue; 4]>,
);

impl<'a> DecodedKey<'a> {
    pub fn metric_name(&self) -> &str {
        &self.0
    }

    pub fn sample_name(&self) -> &str {
        &self.1
    }

    /// Label pairs with values normalized to display text.
    pub fn labels(&self) -> impl Iterator<Item = (&str, String)> + '_ {
        self.2
            .iter()
            .zip(self.3.iter())
            .map(|(name, value)| (name.as_str(), label_value_text(value)))
    }
}

/// Decode and validate a key. Anything that is not a four-element array
/// with matching name/value arity is rejected; the aggregator drops the
/// sample and moves on.
pub fn decode_key(bytes: &[u8]) -> Result<DecodedKey<'_>> {
    let key: DecodedKey<'_> =
        serde_json::from_slice(bytes).map_err(|e| eyre!("invalid entry key: {e}"))?;

    ensure!(
        key.2.len() == key.3.len(),
        "entry key has {} label names but {} values",
        key.2.len(),
        key.3.len()
    );

    Ok(key)
}

/// Render a raw JSON label value the way the exposition format expects:
/// strings unescaped, null empty, numbers and booleans verbatim.
fn label_value_text(raw: &RawValue) -> String {
    let text = raw.get();
    match text {
        "null" => String::new(),
        t if t.starts_with('"') => {
            serde_json::from_str::<String>(t).unwrap_or_else(|_| t.trim_matches('"').to_string())
        }
        t => t.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_canonical_under_label_permutation() {
        let forward = encode_key("http_requests", "http_requests_total", &[("code", "200"), ("method", "get")]);
        let reverse = encode_key("http_requests", "http_requests_total", &[("method", "get"), ("code", "200")]);

        assert_eq!(forward, reverse);
        assert_eq!(
            std::str::from_utf8(&forward).unwrap(),
            r#"["http_requests","http_requests_total",["code","method"],["200","get"]]"#
        );
    }

    #[test]
    fn encode_without_labels() {
        let key = encode_key("up", "up", &[]);
        assert_eq!(std::str::from_utf8(&key).unwrap(), r#"["up","up",[],[]]"#);
    }

    #[test]
    fn decode_roundtrip() {
        let key = encode_key("family", "family_sum", &[("shard", "a")]);
        let decoded = decode_key(&key).unwrap();

        assert_eq!(decoded.metric_name(), "family");
        assert_eq!(decoded.sample_name(), "family_sum");
        assert_eq!(
            decoded.labels().collect::<Vec<_>>(),
            vec![("shard", "a".to_string())]
        );
    }

    #[test]
    fn decode_normalizes_json_label_values() {
        let raw = br#"["m","m",["a","b","c","d"],["text",403,-0.2e5,null]]"#;
        let decoded = decode_key(raw).unwrap();

        let labels: Vec<_> = decoded.labels().collect();
        assert_eq!(labels[0], ("a", "text".to_string()));
        assert_eq!(labels[1], ("b", "403".to_string()));
        assert_eq!(labels[2], ("c", "-0.2e5".to_string()));
        assert_eq!(labels[3], ("d", String::new()));
    }

    #[test]
    fn decode_unescapes_string_values() {
        let raw = br#"["m","m",["path"],["a\"b"]]"#;
        let decoded = decode_key(raw).unwrap();
        assert_eq!(decoded.labels().next().unwrap().1, "a\"b");
    }

    #[test]
    fn decode_rejects_malformed_keys() {
        assert!(decode_key(b"[not json").is_err());
        assert!(decode_key(br#"["m","m",["a"]]"#).is_err(), "missing values array");
        assert!(
            decode_key(br#"["m","m",["a"],["1","2"]]"#).is_err(),
            "arity mismatch"
        );
        assert!(
            decode_key(br#"[["m"],"m",["a"],["1"]]"#).is_err(),
            "nested family name"
        );
    }
}
