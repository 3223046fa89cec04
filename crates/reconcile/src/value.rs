//! Input values and deferred references
//!
//! An [`Input`] is either a literal or a structure that may embed
//! [`DeferredRef`]s: references to outputs of other nodes that only become known
//! once those nodes are provisioned.

use crate::error::{Error, Result};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const REF_KEY: &str = "$ref";
const OUTPUT_KEY: &str = "output";
const CONCAT_KEY: &str = "$concat";

/// One step of an [`OutputPath`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Object field
    Field(String),
    /// Array element
    Index(usize),
}

/// Location of a value inside a node's captured outputs
///
/// Written as a dotted path with indexing, e.g.
/// `status.loadBalancer.ingress[0].hostname`. The first segment is always an
/// output field name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputPath(Vec<PathSegment>);

impl OutputPath {
    /// Path to a top-level output field
    pub fn field(name: impl Into<String>) -> Self {
        Self(vec![PathSegment::Field(name.into())])
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// Name of the top-level output field this path starts at
    pub fn root_field(&self) -> &str {
        match self.0.first() {
            Some(PathSegment::Field(name)) => name,
            _ => "",
        }
    }

    /// Find the value this path points at
    pub fn lookup<'v>(&self, outputs: &'v BTreeMap<String, Value>) -> Option<&'v Value> {
        let mut segments = self.0.iter();
        let PathSegment::Field(first) = segments.next()? else {
            return None;
        };

        let mut current = outputs.get(first)?;
        for segment in segments {
            current = match segment {
                PathSegment::Field(name) => current.get(name.as_str())?,
                PathSegment::Index(index) => current.get(*index)?,
            };
        }
        Some(current)
    }
}

impl FromStr for OutputPath {
    type Err = Error;

    fn from_str(path: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        if path.is_empty() {
            return Err(invalid("path is empty"));
        }

        let mut segments = Vec::new();
        for part in path.split('.') {
            let (name, mut rest) = match part.find('[') {
                Some(i) => part.split_at(i),
                None => (part, ""),
            };
            if name.is_empty() {
                return Err(invalid("empty field name"));
            }
            if name.contains(']') {
                return Err(invalid("unbalanced ']'"));
            }
            segments.push(PathSegment::Field(name.to_string()));

            while !rest.is_empty() {
                let Some(inner) = rest.strip_prefix('[') else {
                    return Err(invalid("expected '[' after index"));
                };
                let Some(end) = inner.find(']') else {
                    return Err(invalid("missing ']'"));
                };
                let index = inner[..end]
                    .parse::<usize>()
                    .map_err(|_| invalid("index must be a non-negative integer"))?;
                segments.push(PathSegment::Index(index));
                rest = &inner[end + 1..];
            }
        }

        Ok(Self(segments))
    }
}

impl fmt::Display for OutputPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Field(name) if i == 0 => write!(f, "{name}")?,
                PathSegment::Field(name) => write!(f, ".{name}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

impl Serialize for OutputPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OutputPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Reference to an output of another node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeferredRef {
    /// Producing node id
    #[serde(rename = "$ref")]
    pub node: String,
    /// Where in the producer's outputs the value lives
    pub output: OutputPath,
}

impl DeferredRef {
    /// Reference a top-level output field
    pub fn field(node: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            output: OutputPath::field(field),
        }
    }

    /// Reference a nested output, parsing `path`
    pub fn parse(node: impl Into<String>, path: &str) -> Result<Self> {
        Ok(Self {
            node: node.into(),
            output: path.parse()?,
        })
    }
}

impl fmt::Display for DeferredRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.output)
    }
}

/// String interpolation of several inputs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Concat {
    #[serde(rename = "$concat")]
    pub parts: Vec<Input>,
}

/// A declared input property
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Input {
    /// Output of another node
    Deferred(DeferredRef),
    /// Parts joined into one string
    Concat(Concat),
    /// Sequence whose elements may be deferred
    List(Vec<Input>),
    /// Record whose fields may be deferred
    Map(BTreeMap<String, Input>),
    /// Known value
    Literal(Value),
}

impl Input {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// A top-level output field of `node`
    pub fn output(node: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Deferred(DeferredRef::field(node, field))
    }

    /// A nested output of `node`, e.g. `ingress[0].hostname`
    pub fn deferred(node: impl Into<String>, path: &str) -> Result<Self> {
        DeferredRef::parse(node, path).map(Self::Deferred)
    }

    pub fn concat(parts: impl IntoIterator<Item = Input>) -> Self {
        Self::Concat(Concat {
            parts: parts.into_iter().collect(),
        })
    }

    pub fn list(items: impl IntoIterator<Item = Input>) -> Self {
        Self::List(items.into_iter().collect())
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Input)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Every deferred reference in this input, depth-first
    pub fn references(&self) -> Vec<&DeferredRef> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a DeferredRef>) {
        match self {
            Self::Deferred(r) => out.push(r),
            Self::Concat(concat) => {
                for part in &concat.parts {
                    part.collect_references(out);
                }
            }
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(fields) => {
                for value in fields.values() {
                    value.collect_references(out);
                }
            }
            Self::Literal(_) => {}
        }
    }

    /// Whether the value is known without provisioning anything
    pub fn is_known(&self) -> bool {
        self.references().is_empty()
    }

    /// Apply `f` to every literal leaf
    pub fn try_for_each_literal_mut<E, F>(&mut self, f: &mut F) -> std::result::Result<(), E>
    where
        F: FnMut(&mut Value) -> std::result::Result<(), E>,
    {
        match self {
            Self::Deferred(_) => Ok(()),
            Self::Concat(concat) => concat
                .parts
                .iter_mut()
                .try_for_each(|p| p.try_for_each_literal_mut(f)),
            Self::List(items) => items
                .iter_mut()
                .try_for_each(|i| i.try_for_each_literal_mut(f)),
            Self::Map(fields) => fields
                .values_mut()
                .try_for_each(|v| v.try_for_each_literal_mut(f)),
            Self::Literal(value) => f(value),
        }
    }

    /// Convert a JSON document into an input
    ///
    /// Objects with a `$ref` key become deferred references, objects with a
    /// `$concat` key become interpolations.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) if map.contains_key(REF_KEY) => {
                let mut node = None;
                let mut output = None;
                for (key, v) in map {
                    match key.as_str() {
                        REF_KEY => node = v.as_str().map(str::to_string),
                        OUTPUT_KEY => output = v.as_str().map(str::to_string),
                        _ => return Err(invalid_input(format!("unexpected key '{key}' in $ref"))),
                    }
                }
                let node = node.ok_or_else(|| invalid_input("$ref must be a node id string"))?;
                let output = output
                    .ok_or_else(|| invalid_input(format!("$ref to '{node}' has no output path")))?;
                Ok(Self::Deferred(DeferredRef::parse(node, &output)?))
            }
            Value::Object(mut map) if map.contains_key(CONCAT_KEY) => {
                if map.len() > 1 {
                    return Err(invalid_input("$concat must be the only key"));
                }
                match map.remove(CONCAT_KEY) {
                    Some(Value::Array(parts)) => Ok(Self::concat(
                        parts
                            .into_iter()
                            .map(Self::from_json)
                            .collect::<Result<Vec<_>>>()?,
                    )),
                    _ => Err(invalid_input("$concat must be an array")),
                }
            }
            Value::Object(map) => Ok(Self::Map(
                map.into_iter()
                    .map(|(k, v)| Ok((k, Self::from_json(v)?)))
                    .collect::<Result<_>>()?,
            )),
            Value::Array(items) => Ok(Self::List(
                items
                    .into_iter()
                    .map(Self::from_json)
                    .collect::<Result<_>>()?,
            )),
            scalar => Ok(Self::Literal(scalar)),
        }
    }
}

fn invalid_input(reason: impl Into<String>) -> Error {
    Error::InvalidInput {
        reason: reason.into(),
    }
}

impl<'de> Deserialize<'de> for Input {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(value).map_err(de::Error::custom)
    }
}

impl From<DeferredRef> for Input {
    fn from(r: DeferredRef) -> Self {
        Self::Deferred(r)
    }
}

impl From<&str> for Input {
    fn from(s: &str) -> Self {
        Self::Literal(Value::String(s.to_string()))
    }
}

impl From<String> for Input {
    fn from(s: String) -> Self {
        Self::Literal(Value::String(s))
    }
}

impl From<i64> for Input {
    fn from(n: i64) -> Self {
        Self::Literal(Value::from(n))
    }
}

impl From<bool> for Input {
    fn from(b: bool) -> Self {
        Self::Literal(Value::Bool(b))
    }
}

impl From<Vec<Input>> for Input {
    fn from(items: Vec<Input>) -> Self {
        Self::List(items)
    }
}
