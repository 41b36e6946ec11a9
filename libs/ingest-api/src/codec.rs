use serde::{Deserialize, Serialize};

use crate::error::PluginError;
use crate::types::Reference;

/// Wire form of a [`Reference`]: a JSON object with exactly the keys
/// `id`, `name`, and an optional base64 `metadata`. Unknown keys are
/// tolerated on decode; messages produced before `metadata` existed
/// (no such key at all) still decode via `#[serde(default)]`.
#[derive(Debug, Serialize, Deserialize)]
struct WireReference {
    id: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_base64")]
    metadata: Option<Vec<u8>>,
}

mod opt_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            Some(s) => base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Serialize a [`Reference`] to its canonical wire bytes.
pub fn marshal(r: &Reference) -> Result<Vec<u8>, PluginError> {
    let wire = WireReference {
        id: r.id.clone(),
        name: r.name.clone(),
        metadata: if r.metadata.is_empty() { None } else { Some(r.metadata.clone()) },
    };
    Ok(serde_json::to_vec(&wire)?)
}

/// Deserialize wire bytes back into a [`Reference`].
///
/// `unmarshal(marshal(r)) == r` for every `r` — see
/// `ingest_api::codec::tests::round_trip`.
pub fn unmarshal(bytes: &[u8]) -> Result<Reference, PluginError> {
    let wire: WireReference = serde_json::from_slice(bytes)?;
    Ok(Reference {
        id: wire.id,
        name: wire.name,
        metadata: wire.metadata.unwrap_or_default(),
    })
}

/// Same shape as [`marshal`]/[`unmarshal`] but as a `serde_json::Value`
/// rather than bytes, for embedding a `Reference` directly in an RPC
/// frame's `params`/`result` field instead of double-encoding it.
pub fn to_value(r: &Reference) -> serde_json::Value {
    let wire = WireReference {
        id: r.id.clone(),
        name: r.name.clone(),
        metadata: if r.metadata.is_empty() { None } else { Some(r.metadata.clone()) },
    };
    serde_json::to_value(wire).expect("WireReference always serializes")
}

pub fn from_value(v: serde_json::Value) -> Result<Reference, PluginError> {
    let wire: WireReference = serde_json::from_value(v)?;
    Ok(Reference { id: wire.id, name: wire.name, metadata: wire.metadata.unwrap_or_default() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cases = [
            Reference::new("id-1", "foo.bin"),
            Reference::new("id-2", "bar.bin").with_metadata(vec![1, 2, 3, 0, 255]),
            Reference::new("", ""),
        ];
        for r in cases {
            let bytes = marshal(&r).unwrap();
            let back = unmarshal(&bytes).unwrap();
            assert_eq!(r, back);
        }
    }

    #[test]
    fn canonical_shape_has_no_metadata_key_when_empty() {
        let bytes = marshal(&Reference::new("a", "b")).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("metadata").is_none());
        assert_eq!(value.get("id").unwrap(), "a");
        assert_eq!(value.get("name").unwrap(), "b");
    }

    #[test]
    fn old_form_without_metadata_key_is_readable() {
        let old = br#"{"id":"x","name":"y"}"#;
        let r = unmarshal(old).unwrap();
        assert_eq!(r, Reference::new("x", "y"));
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let bytes = br#"{"id":"x","name":"y","extra":123}"#;
        let r = unmarshal(bytes).unwrap();
        assert_eq!(r, Reference::new("x", "y"));
    }
}
