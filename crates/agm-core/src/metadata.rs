//! Key vectors and metadata bundles.
//!
//! A metadata bundle carries the three selectors the graph engine
//! understands: the graph key vector (GKV, selects topology), the
//! calibration key vector (CKV, selects tuning data) and an optional
//! property bag. Bundles arrive from clients as a flat byte buffer
//! ([`Metadata::from_bytes`]), are merged per session/interface/device
//! ([`Metadata::merge`]) and patched by calibration updates
//! ([`Metadata::update_cal`]).

use crate::{AgmError, Result};

/// One key/value entry of a key vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyValue {
    /// Key identifier.
    pub key: u32,
    /// Value for the key.
    pub value: u32,
}

impl KeyValue {
    /// Create a key/value entry.
    pub const fn new(key: u32, value: u32) -> Self {
        Self { key, value }
    }
}

/// An ordered key vector.
///
/// Order is preserved and duplicate keys are retained: the engine
/// treats key vectors as multisets, so merge concatenates rather than
/// dedupes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyVector {
    entries: Vec<KeyValue>,
}

impl KeyVector {
    /// Create an empty key vector.
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Build a key vector from `(key, value)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u32, u32)>) -> Self {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| KeyValue::new(k, v))
                .collect(),
        }
    }

    /// Append an entry.
    pub fn push(&mut self, kv: KeyValue) {
        self.entries.push(kv);
    }

    /// Append all entries of `other`, preserving order.
    pub fn extend_from(&mut self, other: &KeyVector) {
        self.entries.extend_from_slice(&other.entries);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the vector has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in order.
    pub fn entries(&self) -> &[KeyValue] {
        &self.entries
    }

    /// True if any entry carries `key`.
    pub fn contains_key(&self, key: u32) -> bool {
        self.entries.iter().any(|kv| kv.key == key)
    }

    /// Replace the value of every entry with `key`; returns whether any
    /// entry matched.
    pub fn replace(&mut self, key: u32, value: u32) -> bool {
        let mut found = false;
        for kv in &mut self.entries {
            if kv.key == key {
                kv.value = value;
                found = true;
            }
        }
        found
    }
}

impl FromIterator<KeyValue> for KeyVector {
    fn from_iter<T: IntoIterator<Item = KeyValue>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Property bag attached to a metadata bundle.
///
/// Used by the engine for subgraph-scoped operations (e.g. stopping a
/// single stream-device leg). A `prop_id` of zero means "no properties".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyData {
    /// Property identifier.
    pub prop_id: u32,
    /// Property values.
    pub values: Vec<u32>,
}

impl PropertyData {
    /// True if no property is set.
    pub fn is_empty(&self) -> bool {
        self.prop_id == 0 && self.values.is_empty()
    }
}

/// A metadata bundle: graph keys, calibration keys and properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Graph key vector — selects the engine subgraph topology.
    pub gkv: KeyVector,
    /// Calibration key vector — selects tuning data.
    pub ckv: KeyVector,
    /// Property bag.
    pub props: PropertyData,
}

/// Reads one little-endian u32 and advances the cursor.
fn take_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let end = pos
        .checked_add(4)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| AgmError::invalid_argument("metadata blob truncated"))?;
    let value = u32::from_le_bytes(bytes[*pos..end].try_into().expect("4-byte slice"));
    *pos = end;
    Ok(value)
}

fn take_key_vector(bytes: &[u8], pos: &mut usize) -> Result<KeyVector> {
    let count = take_u32(bytes, pos)? as usize;
    let mut kv = KeyVector::new();
    for _ in 0..count {
        let key = take_u32(bytes, pos)?;
        let value = take_u32(bytes, pos)?;
        kv.push(KeyValue::new(key, value));
    }
    Ok(kv)
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

impl Metadata {
    /// True if the bundle carries no keys and no properties.
    pub fn is_empty(&self) -> bool {
        self.gkv.is_empty() && self.ckv.is_empty() && self.props.is_empty()
    }

    /// Parse a bundle from the client wire format.
    ///
    /// Layout (all fields little-endian u32):
    ///
    /// ```text
    /// num_gkv, { key, value } * num_gkv,
    /// num_ckv, { key, value } * num_ckv,
    /// num_properties, { prop_id, num_values, values[] } * num_properties
    /// ```
    ///
    /// Truncated buffers and trailing bytes are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let gkv = take_key_vector(bytes, &mut pos)?;
        let ckv = take_key_vector(bytes, &mut pos)?;

        let num_props = take_u32(bytes, &mut pos)?;
        let mut props = PropertyData::default();
        for i in 0..num_props {
            let prop_id = take_u32(bytes, &mut pos)?;
            let num_values = take_u32(bytes, &mut pos)? as usize;
            let mut values = Vec::with_capacity(num_values);
            for _ in 0..num_values {
                values.push(take_u32(bytes, &mut pos)?);
            }
            // Bundles carry at most one property bag; keep the first.
            if i == 0 {
                props = PropertyData { prop_id, values };
            }
        }

        if pos != bytes.len() {
            return Err(AgmError::invalid_argument(format!(
                "metadata blob has {} trailing bytes",
                bytes.len() - pos
            )));
        }

        Ok(Self { gkv, ckv, props })
    }

    /// Serialize to the client wire format. Inverse of [`from_bytes`].
    ///
    /// [`from_bytes`]: Metadata::from_bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, self.gkv.len() as u32);
        for kv in self.gkv.entries() {
            put_u32(&mut out, kv.key);
            put_u32(&mut out, kv.value);
        }
        put_u32(&mut out, self.ckv.len() as u32);
        for kv in self.ckv.entries() {
            put_u32(&mut out, kv.key);
            put_u32(&mut out, kv.value);
        }
        if self.props.is_empty() {
            put_u32(&mut out, 0);
        } else {
            put_u32(&mut out, 1);
            put_u32(&mut out, self.props.prop_id);
            put_u32(&mut out, self.props.values.len() as u32);
            for v in &self.props.values {
                put_u32(&mut out, *v);
            }
        }
        out
    }

    /// Merge bundles into a new owned bundle.
    ///
    /// GKVs and CKVs are concatenated in input order with duplicates
    /// retained; the property bag comes from the first input whose bag
    /// is non-empty. Merging is associative for the engine, which
    /// treats key vectors as multisets.
    pub fn merge<'a>(inputs: impl IntoIterator<Item = &'a Metadata>) -> Metadata {
        let mut merged = Metadata::default();
        for input in inputs {
            merged.gkv.extend_from(&input.gkv);
            merged.ckv.extend_from(&input.ckv);
            if merged.props.is_empty() && !input.props.is_empty() {
                merged.props = input.props.clone();
            }
        }
        merged
    }

    /// Apply a calibration patch: entries whose key already exists in
    /// the CKV have their value replaced, new keys are appended.
    ///
    /// A later calibration update therefore always beats earlier
    /// defaults.
    pub fn update_cal(&mut self, patch: &KeyVector) {
        for kv in patch.entries() {
            if !self.ckv.replace(kv.key, kv.value) {
                self.ckv.push(*kv);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bundle(gkv: &[(u32, u32)], ckv: &[(u32, u32)]) -> Metadata {
        Metadata {
            gkv: KeyVector::from_pairs(gkv.iter().copied()),
            ckv: KeyVector::from_pairs(ckv.iter().copied()),
            props: PropertyData::default(),
        }
    }

    #[test]
    fn wire_roundtrip_with_props() {
        let mut meta = bundle(&[(1, 100), (2, 200)], &[(9, 1)]);
        meta.props = PropertyData {
            prop_id: 0x42,
            values: vec![7, 8, 9],
        };
        let bytes = meta.to_bytes();
        assert_eq!(Metadata::from_bytes(&bytes).unwrap(), meta);
    }

    #[test]
    fn empty_bundle_roundtrip() {
        let meta = Metadata::default();
        let bytes = meta.to_bytes();
        assert_eq!(bytes.len(), 12); // three zero counts
        assert_eq!(Metadata::from_bytes(&bytes).unwrap(), meta);
    }

    #[test]
    fn truncated_blob_rejected() {
        let meta = bundle(&[(1, 100)], &[]);
        let bytes = meta.to_bytes();
        let err = Metadata::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, AgmError::InvalidArgument(_)));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let meta = bundle(&[(1, 100)], &[]);
        let mut bytes = meta.to_bytes();
        bytes.push(0);
        assert!(Metadata::from_bytes(&bytes).is_err());
    }

    #[test]
    fn merge_concatenates_and_keeps_duplicates() {
        let a = bundle(&[(1, 100)], &[(5, 1)]);
        let b = bundle(&[(1, 100), (2, 200)], &[(5, 2)]);
        let merged = Metadata::merge([&a, &b]);
        assert_eq!(merged.gkv.len(), 3);
        assert_eq!(merged.ckv.len(), 2);
        assert_eq!(merged.gkv.entries()[0], KeyValue::new(1, 100));
        assert_eq!(merged.gkv.entries()[2], KeyValue::new(2, 200));
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let a = bundle(&[(1, 100), (2, 200)], &[(5, 1)]);
        let merged = Metadata::merge([&a, &Metadata::default()]);
        assert_eq!(merged, a);
    }

    #[test]
    fn merge_props_from_first_nonempty() {
        let mut a = bundle(&[(1, 1)], &[]);
        let mut b = bundle(&[(2, 2)], &[]);
        a.props = PropertyData {
            prop_id: 0x10,
            values: vec![1],
        };
        b.props = PropertyData {
            prop_id: 0x20,
            values: vec![2],
        };
        let merged = Metadata::merge([&Metadata::default(), &a, &b]);
        assert_eq!(merged.props.prop_id, 0x10);
    }

    #[test]
    fn update_cal_replaces_existing_key() {
        let mut meta = bundle(&[], &[(5, 1), (6, 2)]);
        meta.update_cal(&KeyVector::from_pairs([(5, 99)]));
        assert_eq!(meta.ckv.entries()[0], KeyValue::new(5, 99));
        assert_eq!(meta.ckv.len(), 2);
    }

    #[test]
    fn update_cal_appends_new_key() {
        let mut meta = bundle(&[], &[(5, 1)]);
        meta.update_cal(&KeyVector::from_pairs([(7, 3)]));
        assert_eq!(meta.ckv.len(), 2);
        assert_eq!(meta.ckv.entries()[1], KeyValue::new(7, 3));
    }

    proptest! {
        #[test]
        fn wire_roundtrip(gkv in prop::collection::vec((any::<u32>(), any::<u32>()), 0..16),
                          ckv in prop::collection::vec((any::<u32>(), any::<u32>()), 0..16)) {
            let meta = bundle(&gkv, &ckv);
            let bytes = meta.to_bytes();
            prop_assert_eq!(Metadata::from_bytes(&bytes).unwrap(), meta);
        }

        #[test]
        fn merge_is_associative(a in prop::collection::vec((any::<u32>(), any::<u32>()), 0..8),
                                b in prop::collection::vec((any::<u32>(), any::<u32>()), 0..8),
                                c in prop::collection::vec((any::<u32>(), any::<u32>()), 0..8)) {
            let (a, b, c) = (bundle(&a, &[]), bundle(&b, &[]), bundle(&c, &[]));
            let left = Metadata::merge([&Metadata::merge([&a, &b]), &c]);
            let right = Metadata::merge([&a, &Metadata::merge([&b, &c])]);
            prop_assert_eq!(left, right);
        }
    }
}
