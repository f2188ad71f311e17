//! The insertion-ordered associative container backing array values.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::reftable::SlotId;
use crate::value::{Tag, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// An array key: an integer or a byte string.
///
/// Numeric strings that spell a canonical integer are stored as integers,
/// so `$a["7"]` and `$a[7]` address the same node.
pub enum ArrayKey {
    /// An integer key.
    Int(i64),
    /// A byte-string key.
    Str(Arc<[u8]>),
}

impl ArrayKey {
    /// Canonicalize a key value: bools and reals degrade to integers, null
    /// becomes the empty string, and canonical-integer strings become
    /// integer keys.
    pub fn from_value(value: &Value) -> Self {
        match value.tag() {
            Tag::Bool | Tag::Int => Self::Int(value.cast_int()),
            Tag::Real => Self::Int(value.cast_real() as i64),
            Tag::Null => Self::Str(Arc::from(&b""[..])),
            _ => Self::from_bytes(&value.cast_str()),
        }
    }

    /// Canonicalize a byte-string key.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match canonical_int(bytes) {
            Some(i) => Self::Int(i),
            None => Self::Str(Arc::from(bytes)),
        }
    }

    /// The key as a value, for foreach key binding.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(i) => Value::int(*i),
            Self::Str(s) => Value::bytes(s.to_vec()),
        }
    }
}

impl fmt::Display for ArrayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{}", String::from_utf8_lossy(s)),
        }
    }
}

/// Whether the bytes spell an integer in canonical form: no leading zeros
/// (other than `0` itself), optional `-`, and a value that fits the key
/// cell.
fn canonical_int(bytes: &[u8]) -> Option<i64> {
    let (digits, negative) = match bytes {
        [b'-', rest @ ..] => (rest, true),
        other => (other, false),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return None;
    }
    if negative && digits == b"0" {
        return None;
    }
    let text = std::str::from_utf8(bytes).ok()?;
    text.parse().ok()
}

#[derive(Debug, Default)]
/// The ordered map behind an array value.
///
/// Nodes store reference-table slot indices, never values inline; two
/// entries may share a slot, which is how by-reference array semantics
/// work. The map itself is shared between values through `Rc`.
pub struct Hashmap {
    entries: IndexMap<ArrayKey, SlotId>,
    next_index: i64,
}

impl Hashmap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no nodes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The next automatic integer key.
    pub fn auto_key(&self) -> ArrayKey {
        ArrayKey::Int(self.next_index)
    }

    /// Insert or update the node for `key`; a missing key selects the next
    /// automatic integer index. Returns the key actually used.
    pub fn insert(&mut self, key: Option<ArrayKey>, slot: SlotId) -> ArrayKey {
        let key = key.unwrap_or_else(|| self.auto_key());
        if let ArrayKey::Int(i) = key {
            self.next_index = self.next_index.max(i.saturating_add(1));
        }
        self.entries.insert(key.clone(), slot);
        key
    }

    /// The slot held by `key`'s node.
    pub fn get(&self, key: &ArrayKey) -> Option<SlotId> {
        self.entries.get(key).copied()
    }

    /// Whether a node exists for `key`.
    pub fn contains(&self, key: &ArrayKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove the node for `key`, preserving the order of the remaining
    /// nodes. The caller decides what happens to the held slot.
    pub fn remove(&mut self, key: &ArrayKey) -> Option<SlotId> {
        self.entries.shift_remove(key)
    }

    /// Iterate nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&ArrayKey, &SlotId)> {
        self.entries.iter()
    }

    /// The keys in insertion order.
    pub fn keys(&self) -> Vec<ArrayKey> {
        self.entries.keys().cloned().collect()
    }

    /// The slots in insertion order.
    pub fn slots(&self) -> Vec<SlotId> {
        self.entries.values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_string_keys_canonicalize() {
        assert_eq!(ArrayKey::from_bytes(b"7"), ArrayKey::Int(7));
        assert_eq!(ArrayKey::from_bytes(b"-7"), ArrayKey::Int(-7));
        assert_eq!(ArrayKey::from_bytes(b"07"), ArrayKey::Str(Arc::from(&b"07"[..])));
        assert_eq!(ArrayKey::from_bytes(b"7x"), ArrayKey::Str(Arc::from(&b"7x"[..])));
        assert_eq!(ArrayKey::from_bytes(b"-0"), ArrayKey::Str(Arc::from(&b"-0"[..])));
    }

    #[test]
    fn insertion_order_survives_removal() {
        let mut map = Hashmap::new();
        map.insert(Some(ArrayKey::Int(10)), SlotId::new(0));
        map.insert(Some(ArrayKey::from_bytes(b"k")), SlotId::new(1));
        map.insert(None, SlotId::new(2));
        // Auto index continues past the highest integer key seen.
        assert_eq!(map.keys()[2], ArrayKey::Int(11));

        map.remove(&ArrayKey::Int(10));
        assert_eq!(
            map.keys(),
            vec![ArrayKey::from_bytes(b"k"), ArrayKey::Int(11)]
        );
    }
}
