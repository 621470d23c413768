//! Workflow definition model.
//!
//! A workflow is an immutable tree of typed nodes. Composite nodes
//! ([`Node::Sequence`], [`Node::ForEach`]) carry children; leaves describe a
//! single durable step. Props may embed [`Reference`] values that are resolved
//! against the instance blackboard immediately before a leaf executes, never
//! at registration time.

use std::collections::HashSet;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// A path-tagged pointer into the blackboard, serialized as
/// `{"__ref": true, "path": "$.a.b.c"}`.
///
/// References are stored as-is in definitions and only resolved at execution
/// time, which is what lets a single definition drive many instances.
#[derive(Clone, Debug, PartialEq)]
pub struct Reference {
    pub path: String,
}

impl Reference {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("__ref", &true)?;
        map.serialize_entry("path", &self.path)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct RawReference {
            #[serde(rename = "__ref")]
            marker: bool,
            path: String,
        }
        let raw = RawReference::deserialize(deserializer)?;
        if !raw.marker {
            return Err(serde::de::Error::custom("reference marker must be true"));
        }
        Ok(Reference { path: raw.path })
    }
}

/// A node property that is either a reference or a literal JSON value.
///
/// Literal values may still embed references at any depth (e.g. inside a
/// request body); those are resolved recursively by the blackboard module.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Reference(Reference),
    Literal(Value),
}

impl PropValue {
    pub fn reference(path: impl Into<String>) -> Self {
        Self::Reference(Reference::new(path))
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }
}

/// A blackboard mutation produced by a successful step.
///
/// Patches apply in the order returned, against the un-scoped instance
/// blackboard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Patch {
    Set {
        path: String,
        value: Value,
    },
    Merge {
        path: String,
        value: serde_json::Map<String, Value>,
    },
    Del {
        path: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SequenceProps {}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForEachProps {
    /// Reference or dotted path resolving to the array to iterate, or a
    /// literal array.
    pub items: PropValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HitEndpointProps {
    pub url: PropValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<PropValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<PropValue>,
    /// Blackboard path receiving `{status, statusText, headers, body}`.
    pub assign_to: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SleepProps {
    pub seconds: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendEmailProps {
    pub to: PropValue,
    pub subject: PropValue,
    pub body: PropValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvGetProps {
    pub store: PropValue,
    pub key: PropValue,
    pub assign_to: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KvSetProps {
    pub store: PropValue,
    pub key: PropValue,
    pub value: PropValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailForProps {
    /// Number of leading attempts that fail before the node succeeds.
    pub times: i32,
}

/// One node of a workflow definition tree.
///
/// Serializes to the normative `{type, id, props, children?}` wire shape.
/// A type tag this runtime does not recognize parses as [`Node::Unknown`]
/// rather than rejecting the whole tree; the executor fails such a step with
/// a descriptive error, so it spends a normal retry budget and leaves its
/// error on the step row.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Sequence {
        id: String,
        props: SequenceProps,
        children: Vec<Node>,
    },
    ForEach {
        id: String,
        props: ForEachProps,
        children: Vec<Node>,
    },
    HitEndpoint {
        id: String,
        props: HitEndpointProps,
    },
    Sleep {
        id: String,
        props: SleepProps,
    },
    SendEmail {
        id: String,
        props: SendEmailProps,
    },
    KvGet {
        id: String,
        props: KvGetProps,
    },
    KvSet {
        id: String,
        props: KvSetProps,
    },
    FailFor {
        id: String,
        props: FailForProps,
    },
    /// A node whose type tag this runtime does not implement. The original
    /// tag and props are preserved so the tree round-trips unchanged.
    Unknown {
        id: String,
        kind: String,
        props: Value,
    },
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.kind_str())?;
        map.serialize_entry("id", self.id())?;
        match self {
            Node::Sequence { props, children, .. } => {
                map.serialize_entry("props", props)?;
                map.serialize_entry("children", children)?;
            }
            Node::ForEach { props, children, .. } => {
                map.serialize_entry("props", props)?;
                map.serialize_entry("children", children)?;
            }
            Node::HitEndpoint { props, .. } => map.serialize_entry("props", props)?,
            Node::Sleep { props, .. } => map.serialize_entry("props", props)?,
            Node::SendEmail { props, .. } => map.serialize_entry("props", props)?,
            Node::KvGet { props, .. } => map.serialize_entry("props", props)?,
            Node::KvSet { props, .. } => map.serialize_entry("props", props)?,
            Node::FailFor { props, .. } => map.serialize_entry("props", props)?,
            Node::Unknown { props, .. } => map.serialize_entry("props", props)?,
        }
        map.end()
    }
}

fn parse_props<T, E>(props: Value) -> Result<T, E>
where
    T: serde::de::DeserializeOwned,
    E: serde::de::Error,
{
    serde_json::from_value(props).map_err(E::custom)
}

fn parse_children<E>(children: Option<Value>, kind: &str) -> Result<Vec<Node>, E>
where
    E: serde::de::Error,
{
    let Some(children) = children else {
        return Err(E::custom(format!("{kind} node requires children")));
    };
    serde_json::from_value(children).map_err(E::custom)
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let mut raw = serde_json::Map::<String, Value>::deserialize(deserializer)?;
        let kind = match raw.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(D::Error::custom("node is missing a string type tag")),
        };
        let id = match raw.get("id") {
            Some(Value::String(id)) => id.clone(),
            _ => {
                return Err(D::Error::custom(format!(
                    "{kind} node is missing a string id"
                )));
            }
        };
        let props = raw
            .remove("props")
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let children = raw.remove("children");

        let node = match kind.as_str() {
            "Sequence" => Node::Sequence {
                id,
                props: parse_props(props)?,
                children: parse_children(children, "Sequence")?,
            },
            "ForEach" => Node::ForEach {
                id,
                props: parse_props(props)?,
                children: parse_children(children, "ForEach")?,
            },
            "HitEndpoint" => Node::HitEndpoint {
                id,
                props: parse_props(props)?,
            },
            "Sleep" => Node::Sleep {
                id,
                props: parse_props(props)?,
            },
            "SendEmail" => Node::SendEmail {
                id,
                props: parse_props(props)?,
            },
            "KVGet" => Node::KvGet {
                id,
                props: parse_props(props)?,
            },
            "KVSet" => Node::KvSet {
                id,
                props: parse_props(props)?,
            },
            "FailFor" => Node::FailFor {
                id,
                props: parse_props(props)?,
            },
            _ => Node::Unknown { id, kind, props },
        };
        Ok(node)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("node id must be non-empty")]
    EmptyNodeId,
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),
    #[error("node {id}: sleep seconds must be >= 0, got {seconds}")]
    NegativeSleepSeconds { id: String, seconds: f64 },
    #[error("node {id}: failure count must be >= 0, got {times}")]
    NegativeFailureCount { id: String, times: i32 },
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Node::Sequence { id, .. }
            | Node::ForEach { id, .. }
            | Node::HitEndpoint { id, .. }
            | Node::Sleep { id, .. }
            | Node::SendEmail { id, .. }
            | Node::KvGet { id, .. }
            | Node::KvSet { id, .. }
            | Node::FailFor { id, .. }
            | Node::Unknown { id, .. } => id,
        }
    }

    pub fn children(&self) -> Option<&[Node]> {
        match self {
            Node::Sequence { children, .. } | Node::ForEach { children, .. } => Some(children),
            _ => None,
        }
    }

    pub fn kind_str(&self) -> &str {
        match self {
            Node::Sequence { .. } => "Sequence",
            Node::ForEach { .. } => "ForEach",
            Node::HitEndpoint { .. } => "HitEndpoint",
            Node::Sleep { .. } => "Sleep",
            Node::SendEmail { .. } => "SendEmail",
            Node::KvGet { .. } => "KVGet",
            Node::KvSet { .. } => "KVSet",
            Node::FailFor { .. } => "FailFor",
            Node::Unknown { kind, .. } => kind,
        }
    }

    /// Validate tree-wide invariants: non-empty unique ids and well-formed
    /// leaf props.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut seen = HashSet::new();
        self.validate_inner(&mut seen)
    }

    fn validate_inner(&self, seen: &mut HashSet<String>) -> Result<(), DefinitionError> {
        let id = self.id();
        if id.is_empty() {
            return Err(DefinitionError::EmptyNodeId);
        }
        if !seen.insert(id.to_string()) {
            return Err(DefinitionError::DuplicateNodeId(id.to_string()));
        }
        match self {
            Node::Sleep { id, props } if props.seconds < 0.0 => {
                return Err(DefinitionError::NegativeSleepSeconds {
                    id: id.clone(),
                    seconds: props.seconds,
                });
            }
            Node::FailFor { id, props } if props.times < 0 => {
                return Err(DefinitionError::NegativeFailureCount {
                    id: id.clone(),
                    times: props.times,
                });
            }
            _ => {}
        }
        if let Some(children) = self.children() {
            for child in children {
                child.validate_inner(seen)?;
            }
        }
        Ok(())
    }
}
