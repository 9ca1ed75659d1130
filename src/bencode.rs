//! Canonical bencode emission, used when generating metainfo files.
//!
//! Parsing existing metainfo goes through `serde_bencode` (see the
//! [`metainfo`](crate::metainfo) module); this module only covers the
//! emission side, where the [BEP0003](https://www.bittorrent.org/beps/bep_0003.html)
//! canonical form matters byte for byte: dictionary keys must be emitted
//! sorted by their raw bytes, since the info-hash is defined over the exact
//! serialized bytes of the info dictionary.

use std::collections::BTreeMap;

/// A bencode value under construction.
///
/// Dictionaries use a [`BTreeMap`] keyed by raw bytes, so iteration (and
/// therefore emission) is sorted by construction.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Value {
    /// An integer from/to `i42e`.
    Int(i64),
    /// A bytestring from/to `3:abc`. Also used for UTF-8 text, which the
    /// bencode wire format does not distinguish from binary data.
    Bytes(Vec<u8>),
    /// A list from/to `l...e`.
    List(Vec<Value>),
    /// A dictionary from/to `d...e`, sorted by raw byte key.
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Shorthand for a bytestring value from anything byte-like.
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(b.into())
    }

    /// Shorthand for an empty dictionary.
    pub fn dict() -> Self {
        Value::Dict(BTreeMap::new())
    }

    /// Inserts an entry if this value is a dictionary.
    ///
    /// # Panics
    ///
    /// Panics if the value is not a dictionary; emission code builds its
    /// dictionaries statically so a mismatch is a programming error.
    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: Value) {
        match self {
            Value::Dict(entries) => {
                entries.insert(key.into(), value);
            }
            _ => panic!("bencode insert into non-dict value"),
        }
    }

    /// Returns a mutable reference to the entry under `key`, inserting an
    /// empty dictionary there first if the key is vacant.
    ///
    /// # Panics
    ///
    /// Panics if the value is not a dictionary.
    pub fn entry_dict(&mut self, key: impl Into<Vec<u8>>) -> &mut Value {
        match self {
            Value::Dict(entries) => {
                entries.entry(key.into()).or_insert_with(Value::dict)
            }
            _ => panic!("bencode entry on non-dict value"),
        }
    }

    /// Serializes the value into its canonical byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_int() {
        assert_eq!(Value::Int(42).encode(), b"i42e");
        assert_eq!(Value::Int(0).encode(), b"i0e");
        assert_eq!(Value::Int(-3).encode(), b"i-3e");
    }

    #[test]
    fn test_encode_bytes() {
        assert_eq!(Value::bytes("spam"), Value::Bytes(b"spam".to_vec()));
        assert_eq!(Value::bytes("spam").encode(), b"4:spam");
        assert_eq!(Value::bytes("").encode(), b"0:");
    }

    #[test]
    fn test_encode_list() {
        let list =
            Value::List(vec![Value::bytes("spam"), Value::Int(42)]);
        assert_eq!(list.encode(), b"l4:spami42ee");
    }

    #[test]
    fn test_encode_dict_sorted() {
        let mut dict = Value::dict();
        // inserted out of order on purpose
        dict.insert("zebra", Value::Int(1));
        dict.insert("apple", Value::Int(2));
        dict.insert("mango", Value::Int(3));
        assert_eq!(dict.encode(), b"d5:applei2e5:mangoi3e5:zebrai1ee");
    }

    #[test]
    fn test_encode_nested() {
        let mut info = Value::dict();
        info.insert("length", Value::Int(13));
        info.insert("name", Value::bytes("hello.txt"));
        let mut root = Value::dict();
        root.insert("info", info);
        assert_eq!(
            root.encode(),
            b"d4:infod6:lengthi13e4:name9:hello.txtee".to_vec()
        );
    }

    #[test]
    fn test_entry_dict_builds_tree() {
        let mut tree = Value::dict();
        tree.entry_dict("dir").entry_dict("file").insert(
            "",
            Value::Int(1),
        );
        assert_eq!(tree.encode(), b"d3:dird4:filed0:i1eeee");
    }
}
