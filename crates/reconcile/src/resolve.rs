//! Output resolution
//!
//! Replaces deferred references in a node's inputs with the outputs captured in
//! the state store. The scheduler only resolves a node after every producer it
//! references is `ready`; reading a producer that is not ready is a
//! [`Error::NotReady`] programming error.

use crate::error::{Error, Result};
use crate::node::ResourceNode;
use crate::record::{InputHash, ProvisionRecord};
use crate::store::StateStore;
use crate::value::{DeferredRef, Input};
use serde_json::Value;
use std::collections::BTreeMap;

/// Inputs with every deferred value substituted
pub type ResolvedInputs = BTreeMap<String, Value>;

/// Resolves inputs against a state store
pub struct Resolver<'a> {
    store: &'a dyn StateStore,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a dyn StateStore) -> Self {
        Self { store }
    }

    /// Resolve all inputs of `node`
    pub fn resolve(&self, node: &ResourceNode) -> Result<ResolvedInputs> {
        node.inputs
            .iter()
            .map(|(name, input)| Ok((name.clone(), self.resolve_input(&node.id, input)?)))
            .collect()
    }

    /// Resolve one input on behalf of `owner`, depth-first
    pub fn resolve_input(&self, owner: &str, input: &Input) -> Result<Value> {
        match input {
            Input::Literal(value) => Ok(value.clone()),
            Input::Deferred(reference) => self.lookup(owner, reference),
            Input::List(items) => items
                .iter()
                .map(|item| self.resolve_input(owner, item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Input::Map(fields) => fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve_input(owner, v)?)))
                .collect::<Result<serde_json::Map<_, _>>>()
                .map(Value::Object),
            Input::Concat(concat) => {
                let mut joined = String::new();
                for part in &concat.parts {
                    match self.resolve_input(owner, part)? {
                        Value::String(s) => joined.push_str(&s),
                        Value::Null => {}
                        Value::Bool(b) => joined.push_str(&b.to_string()),
                        Value::Number(n) => joined.push_str(&n.to_string()),
                        Value::Array(_) => {
                            return Err(Error::Interpolation {
                                node: owner.to_string(),
                                found: "list",
                            });
                        }
                        Value::Object(_) => {
                            return Err(Error::Interpolation {
                                node: owner.to_string(),
                                found: "map",
                            });
                        }
                    }
                }
                Ok(Value::String(joined))
            }
        }
    }

    /// Whether `input` derives from an output marked secret
    pub fn touches_secret(&self, input: &Input) -> Result<bool> {
        for reference in input.references() {
            let secret = self
                .store
                .get(&reference.node)?
                .is_some_and(|r| r.is_secret(reference.output.root_field()));
            if secret {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn lookup(&self, owner: &str, reference: &DeferredRef) -> Result<Value> {
        let record = self.ready_record(owner, &reference.node)?;
        reference
            .output
            .lookup(&record.outputs)
            .cloned()
            .ok_or_else(|| Error::MissingOutput {
                node: owner.to_string(),
                target: reference.node.clone(),
                path: reference.output.to_string(),
            })
    }

    fn ready_record(&self, owner: &str, target: &str) -> Result<ProvisionRecord> {
        match self.store.get(target)? {
            Some(record) if record.is_ready() => Ok(record),
            _ => Err(Error::NotReady {
                node: owner.to_string(),
                target: target.to_string(),
            }),
        }
    }
}

/// Hash a node's kind and resolved inputs
///
/// `ResolvedInputs` and JSON objects are ordered maps, so the serialization is
/// canonical and equal inputs always hash equally.
pub fn hash_inputs(kind: &str, inputs: &ResolvedInputs) -> InputHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.as_bytes());
    hasher.update(&[0]);
    // Serializing string-keyed maps of JSON values cannot fail
    let encoded = serde_json::to_vec(inputs).unwrap_or_default();
    hasher.update(&encoded);
    InputHash::from_hex(hasher.finalize().to_hex().to_string())
}
