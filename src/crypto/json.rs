//! BigInt/Map-safe JSON encoding and gzip helpers, used when handing the
//! plaintext `AppState` snapshot across the worker boundary or to the wire.
//! JavaScript's structured-clone handles `BigInt` and `Map` natively; JSON
//! does not, so both are carried as tagged envelopes per spec.md §9:
//! `{__type:"bigint", val:"<decimal>"}` and `{__type:"map", val:[[k,v],...]}`.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use num_bigint::BigUint;
use serde_json::Value;

use crate::error::EngineError;

const BIGINT_TAG: &str = "bigint";
const MAP_TAG: &str = "map";

pub fn tag_bigint(value: &BigUint) -> Value {
    serde_json::json!({ "__type": BIGINT_TAG, "val": value.to_str_radix(10) })
}

pub fn untag_bigint(value: &Value) -> Option<BigUint> {
    if value.get("__type")?.as_str()? != BIGINT_TAG {
        return None;
    }
    let digits = value.get("val")?.as_str()?;
    BigUint::parse_bytes(digits.as_bytes(), 10)
}

/// Tags an ordered key-value sequence as a structured-clone-style `Map`.
pub fn tag_map(pairs: &[(String, String)]) -> Value {
    let val: Vec<Value> = pairs
        .iter()
        .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), Value::String(v.clone())]))
        .collect();
    serde_json::json!({ "__type": MAP_TAG, "val": val })
}

pub fn untag_map(value: &Value) -> Option<Vec<(String, String)>> {
    if value.get("__type")?.as_str()? != MAP_TAG {
        return None;
    }
    let entries = value.get("val")?.as_array()?;
    entries
        .iter()
        .map(|pair| {
            let arr = pair.as_array()?;
            let k = arr.first()?.as_str()?.to_string();
            let v = arr.get(1)?.as_str()?.to_string();
            Some((k, v))
        })
        .collect()
}

pub fn gzip_compress(bytes: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(|e| EngineError::Internal(e.to_string()))?;
    encoder.finish().map_err(|e| EngineError::Internal(e.to_string()))
}

pub fn gzip_decompress(bytes: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| EngineError::corruption(e))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bigint_tag_round_trips() {
        let value = BigUint::from(1234567890123456789u128);
        let tagged = tag_bigint(&value);
        assert_eq!(untag_bigint(&tagged), Some(value));
    }

    #[test]
    fn map_tag_round_trips() {
        let pairs = vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())];
        let tagged = tag_map(&pairs);
        assert_eq!(untag_map(&tagged), Some(pairs));
    }

    #[test]
    fn gzip_round_trips() {
        let original = b"some archive payload".to_vec();
        let compressed = gzip_compress(&original).unwrap();
        let decompressed = gzip_decompress(&compressed).unwrap();
        assert_eq!(decompressed, original);
    }
}
