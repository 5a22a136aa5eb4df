//! The hstore capabilities handed out by a provider.

use std::collections::BTreeMap;

use crate::error::CodecError;

/// Decoded hstore: keys map to a string or to SQL NULL.
pub type HstoreMap = BTreeMap<String, Option<String>>;

/// Parsing and serialization of hstore text.
///
/// Both operations pass SQL NULL through: `None` in, `Ok(None)` out.
pub trait HstoreCodec {
    /// Parses the text representation of an hstore into a map.
    fn parse_hstore(&self, text: Option<&str>) -> Result<Option<HstoreMap>, CodecError>;

    /// Serializes a map into the text representation of an hstore.
    fn serialize_hstore(&self, map: Option<&HstoreMap>) -> Result<Option<String>, CodecError>;
}

/// Rejects keys or values the hstore text format cannot carry.
pub fn validate_pairs(map: &HstoreMap) -> Result<(), CodecError> {
    for (key, value) in map {
        if key.contains('\0') {
            return Err(CodecError::NulByte { what: "keys" });
        }
        if value.as_deref().is_some_and(|v| v.contains('\0')) {
            return Err(CodecError::NulByte { what: "values" });
        }
    }
    Ok(())
}

/// Splits a map into parallel key and value arrays, the shape `hstore(text[], text[])` takes.
pub fn split_pairs(map: &HstoreMap) -> (Vec<String>, Vec<Option<String>>) {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).unzip()
}

/// Builds a map from parallel key and value arrays.
///
/// The first occurrence of a duplicated key wins, as in hstore input.
pub fn zip_pairs(
    keys: Vec<String>,
    values: Vec<Option<String>>,
) -> Result<HstoreMap, CodecError> {
    if keys.len() != values.len() {
        return Err(CodecError::MismatchedArrays {
            keys: keys.len(),
            values: values.len(),
        });
    }
    let mut map = HstoreMap::new();
    for (key, value) in keys.into_iter().zip(values) {
        map.entry(key).or_insert(value);
    }
    Ok(map)
}
