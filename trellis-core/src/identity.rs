//! Identity & Key Resolution
//!
//! Every node instance in the store is addressed by a canonical string:
//!
//! ```text
//! Kind/declarationId/name:argument
//! ```
//!
//! The argument part is a canonical JSON rendering of the instance argument
//! in which object keys are sorted, so two arguments that are structurally
//! equal always produce the same key no matter how their fields were
//! ordered. A missing argument (`()`) renders as the empty string.
//!
//! # Memoization
//!
//! Instances cache their resolved key in a [`KeyCell`] that lives inside the
//! instance itself. The cache never keeps anything else alive, and a freshly
//! built instance with an equal argument simply re-derives the same string,
//! which is what makes independently constructed instances share storage.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use serde_json::Value as Json;

use crate::error::{Result, StoreError};
use crate::graph::NodeKind;

/// Unique identifier of a declaration.
///
/// Ids are process-wide and never reused, so two declarations with the same
/// name still resolve to different keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeclId(u64);

impl DeclId {
    /// Id reserved for the implicit root domain.
    pub const ROOT: DeclId = DeclId(0);

    /// Generate a new unique declaration ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for DeclId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeclId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encode an instance argument canonically.
///
/// Objects are written with sorted keys, `null` at the top level (the unit
/// argument) encodes as the empty string.
pub fn encode_arg<A: Serialize + ?Sized>(arg: &A) -> Result<String> {
    let json =
        serde_json::to_value(arg).map_err(|err| StoreError::InvalidArgument(err.to_string()))?;
    let mut out = String::new();
    if !json.is_null() {
        write_canonical(&json, &mut out);
    }
    Ok(out)
}

fn write_canonical(value: &Json, out: &mut String) {
    match value {
        Json::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Json::String(name.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Json::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Build the canonical key of a node or domain instance.
pub(crate) fn canonical_key(kind: NodeKind, id: DeclId, name: &str, arg: &str) -> Arc<str> {
    Arc::from(format!("{kind}/{id}/{name}:{arg}"))
}

/// Per-instance memo of a resolved canonical key.
#[derive(Debug, Default)]
pub(crate) struct KeyCell(OnceLock<Arc<str>>);

impl KeyCell {
    /// Return the cached key, deriving and caching it on first use.
    pub(crate) fn resolve(&self, derive: impl FnOnce() -> Result<Arc<str>>) -> Result<Arc<str>> {
        if let Some(key) = self.0.get() {
            return Ok(key.clone());
        }
        let key = derive()?;
        Ok(self.0.get_or_init(|| key).clone())
    }

    #[cfg(test)]
    pub(crate) fn is_resolved(&self) -> bool {
        self.0.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    #[derive(Serialize)]
    struct Forward {
        a: u32,
        b: &'static str,
    }

    #[derive(Serialize)]
    struct Backward {
        b: &'static str,
        a: u32,
    }

    #[test]
    fn decl_ids_are_unique() {
        let id1 = DeclId::new();
        let id2 = DeclId::new();
        assert_ne!(id1, id2);
        assert_ne!(id1, DeclId::ROOT);
    }

    #[test]
    fn unit_argument_encodes_as_empty() {
        assert_eq!(encode_arg(&()).unwrap(), "");
        assert_eq!(encode_arg(&Option::<u32>::None).unwrap(), "");
    }

    #[test]
    fn field_order_does_not_matter() {
        let forward = encode_arg(&Forward { a: 1, b: "x" }).unwrap();
        let backward = encode_arg(&Backward { b: "x", a: 1 }).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward, r#"{"a":1,"b":"x"}"#);

        let mut map = HashMap::new();
        map.insert("b", "x".to_string());
        map.insert("a", "1".to_string());
        assert_eq!(encode_arg(&map).unwrap(), r#"{"a":"1","b":"x"}"#);
    }

    #[test]
    fn nested_values_are_canonical() {
        let arg = serde_json::json!({ "z": [null, { "y": 2, "x": 1 }], "k": "v" });
        assert_eq!(
            encode_arg(&arg).unwrap(),
            r#"{"k":"v","z":[null,{"x":1,"y":2}]}"#
        );
    }

    #[test]
    fn canonical_key_format() {
        let id = DeclId::new();
        let key = canonical_key(NodeKind::State, id, "Count", "");
        assert_eq!(&*key, format!("State/{id}/Count:").as_str());
    }

    #[test]
    fn key_cell_derives_once() {
        let cell = KeyCell::default();
        let calls = AtomicUsize::new(0);
        let derive = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::from("Query/7/Total:"))
        };

        assert!(!cell.is_resolved());
        assert_eq!(&*cell.resolve(derive).unwrap(), "Query/7/Total:");
        assert_eq!(&*cell.resolve(derive).unwrap(), "Query/7/Total:");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cell.is_resolved());
    }
}
