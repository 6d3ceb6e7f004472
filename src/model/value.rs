//! Model values
//!
//! A value attached to a property, attribute, input or operation input is
//! either a concrete JSON literal or an unevaluated intrinsic-function node
//! (possibly nested inside lists and maps). Raw maps such as
//! `{"concat": [...]}` are recognized once, at model-load time; afterwards
//! the function is a typed variant, never a stringly map.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;

use crate::errors::ValueError;

/// The intrinsic functions understood by the evaluator
///
/// `GetOperationOutput` and `GetArtifact` are declarative placeholders: they
/// parse and serialize, and raise "cannot evaluate" at plan time.
#[derive(Debug, Clone, PartialEq)]
pub enum IntrinsicFunction {
    /// `concat(list-of-string-expressions)`
    Concat { args: Vec<ModelValue> },
    /// `token(string, separators, index)`
    Token {
        value: Box<ModelValue>,
        separators: String,
        index: usize,
    },
    /// `get_input(name)`
    GetInput { input: String },
    /// `get_property([entity, ...path])`
    GetProperty { path: Vec<String> },
    /// `get_attribute([entity, ...path])`
    GetAttribute { path: Vec<String> },
    /// `get_operation_output([entity, interface, operation, variable])`
    GetOperationOutput { args: Vec<String> },
    /// `get_artifact([entity, artifact, ...])`
    GetArtifact { args: Vec<String> },
    /// `get_nodes_of_type(type_name)`
    GetNodesOfType { type_name: String },
}

impl IntrinsicFunction {
    /// The wire name of this function
    pub fn name(&self) -> &'static str {
        match self {
            IntrinsicFunction::Concat { .. } => "concat",
            IntrinsicFunction::Token { .. } => "token",
            IntrinsicFunction::GetInput { .. } => "get_input",
            IntrinsicFunction::GetProperty { .. } => "get_property",
            IntrinsicFunction::GetAttribute { .. } => "get_attribute",
            IntrinsicFunction::GetOperationOutput { .. } => "get_operation_output",
            IntrinsicFunction::GetArtifact { .. } => "get_artifact",
            IntrinsicFunction::GetNodesOfType { .. } => "get_nodes_of_type",
        }
    }

    /// Render back to the raw single-key map form
    pub fn to_raw(&self) -> Json {
        let arg = match self {
            IntrinsicFunction::Concat { args } => {
                Json::Array(args.iter().map(ModelValue::to_raw).collect())
            }
            IntrinsicFunction::Token {
                value,
                separators,
                index,
            } => Json::Array(vec![
                value.to_raw(),
                Json::String(separators.clone()),
                Json::from(*index),
            ]),
            IntrinsicFunction::GetInput { input } => Json::String(input.clone()),
            IntrinsicFunction::GetProperty { path } => {
                Json::Array(path.iter().cloned().map(Json::String).collect())
            }
            IntrinsicFunction::GetAttribute { path } => {
                Json::Array(path.iter().cloned().map(Json::String).collect())
            }
            IntrinsicFunction::GetOperationOutput { args } => {
                Json::Array(args.iter().cloned().map(Json::String).collect())
            }
            IntrinsicFunction::GetArtifact { args } => {
                Json::Array(args.iter().cloned().map(Json::String).collect())
            }
            IntrinsicFunction::GetNodesOfType { type_name } => Json::String(type_name.clone()),
        };
        let mut map = serde_json::Map::new();
        map.insert(self.name().to_string(), arg);
        Json::Object(map)
    }
}

/// A possibly-function-valued model value
#[derive(Debug, Clone, PartialEq)]
pub enum ModelValue {
    Literal(Json),
    List(Vec<ModelValue>),
    Map(BTreeMap<String, ModelValue>),
    Function(Box<IntrinsicFunction>),
}

const FUNCTION_NAMES: &[&str] = &[
    "concat",
    "token",
    "get_input",
    "get_property",
    "get_attribute",
    "get_operation_output",
    "get_artifact",
    "get_nodes_of_type",
];

impl ModelValue {
    /// Recognize intrinsic functions in a raw JSON value
    ///
    /// A single-key object whose key is a function name becomes a
    /// [`IntrinsicFunction`]; malformed argument shapes are validation
    /// errors, not silently-kept literals.
    pub fn parse(raw: &Json) -> Result<ModelValue, ValueError> {
        match raw {
            Json::Object(map) if map.len() == 1 => {
                let (key, arg) = map.iter().next().expect("len checked");
                if FUNCTION_NAMES.contains(&key.as_str()) {
                    return Ok(ModelValue::Function(Box::new(parse_function(key, arg)?)));
                }
                let mut parsed = BTreeMap::new();
                parsed.insert(key.clone(), ModelValue::parse(arg)?);
                Ok(ModelValue::Map(parsed))
            }
            Json::Object(map) => {
                let mut parsed = BTreeMap::new();
                for (k, v) in map {
                    parsed.insert(k.clone(), ModelValue::parse(v)?);
                }
                Ok(ModelValue::Map(parsed))
            }
            Json::Array(items) => {
                let parsed = items
                    .iter()
                    .map(ModelValue::parse)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ModelValue::List(parsed))
            }
            other => Ok(ModelValue::Literal(other.clone())),
        }
    }

    /// A literal with no embedded functions anywhere
    pub fn literal(value: impl Into<Json>) -> ModelValue {
        ModelValue::Literal(value.into())
    }

    /// True if no function node is embedded at any depth
    pub fn is_concrete(&self) -> bool {
        match self {
            ModelValue::Literal(_) => true,
            ModelValue::Function(_) => false,
            ModelValue::List(items) => items.iter().all(ModelValue::is_concrete),
            ModelValue::Map(map) => map.values().all(ModelValue::is_concrete),
        }
    }

    /// Render back to raw JSON, functions in their single-key map form
    pub fn to_raw(&self) -> Json {
        match self {
            ModelValue::Literal(v) => v.clone(),
            ModelValue::Function(f) => f.to_raw(),
            ModelValue::List(items) => Json::Array(items.iter().map(ModelValue::to_raw).collect()),
            ModelValue::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_raw()))
                    .collect(),
            ),
        }
    }

    /// The concrete JSON value, if fully concrete
    pub fn as_json(&self) -> Option<Json> {
        if self.is_concrete() {
            Some(self.to_raw())
        } else {
            None
        }
    }
}

impl From<Json> for ModelValue {
    fn from(value: Json) -> Self {
        // Infallible entry point for values known to carry no functions
        ModelValue::parse(&value).unwrap_or(ModelValue::Literal(value))
    }
}

fn invalid(function: &'static str, reason: impl Into<String>) -> ValueError {
    ValueError::InvalidArgument {
        function,
        reason: reason.into(),
        locator: None,
    }
}

fn parse_function(name: &str, arg: &Json) -> Result<IntrinsicFunction, ValueError> {
    match name {
        "concat" => {
            let items = arg
                .as_array()
                .ok_or_else(|| invalid("concat", "expected a list of string expressions"))?;
            let args = items
                .iter()
                .map(ModelValue::parse)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(IntrinsicFunction::Concat { args })
        }
        "token" => {
            let items = arg
                .as_array()
                .filter(|a| a.len() == 3)
                .ok_or_else(|| invalid("token", "expected [string, separators, index]"))?;
            let value = Box::new(ModelValue::parse(&items[0])?);
            let separators = items[1]
                .as_str()
                .ok_or_else(|| invalid("token", "separators must be a string"))?
                .to_string();
            let index = items[2]
                .as_u64()
                .ok_or_else(|| invalid("token", "index must be a non-negative integer"))?
                as usize;
            Ok(IntrinsicFunction::Token {
                value,
                separators,
                index,
            })
        }
        "get_input" => {
            let input = arg
                .as_str()
                .ok_or_else(|| invalid("get_input", "expected an input name"))?
                .to_string();
            Ok(IntrinsicFunction::GetInput { input })
        }
        "get_property" => Ok(IntrinsicFunction::GetProperty {
            path: parse_string_path("get_property", arg)?,
        }),
        "get_attribute" => Ok(IntrinsicFunction::GetAttribute {
            path: parse_string_path("get_attribute", arg)?,
        }),
        "get_operation_output" => Ok(IntrinsicFunction::GetOperationOutput {
            args: parse_string_path("get_operation_output", arg)?,
        }),
        "get_artifact" => Ok(IntrinsicFunction::GetArtifact {
            args: parse_string_path("get_artifact", arg)?,
        }),
        "get_nodes_of_type" => {
            let type_name = arg
                .as_str()
                .ok_or_else(|| invalid("get_nodes_of_type", "expected a type name"))?
                .to_string();
            Ok(IntrinsicFunction::GetNodesOfType { type_name })
        }
        _ => unreachable!("caller checked the function-name table"),
    }
}

fn parse_string_path(function: &'static str, arg: &Json) -> Result<Vec<String>, ValueError> {
    let items = arg
        .as_array()
        .ok_or_else(|| invalid(function, "expected [entity, ...path]"))?;
    if items.len() < 2 {
        return Err(invalid(function, "expected an entity and at least one path segment"));
    }
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid(function, "path segments must be strings"))
        })
        .collect()
}

// Persisted entities carry their values in raw JSON form; parsing back to
// typed functions happens on deserialization so storage round-trips keep
// the single-key map encoding stable.
impl Serialize for ModelValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_raw().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ModelValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Json::deserialize(deserializer)?;
        ModelValue::parse(&raw).map_err(D::Error::custom)
    }
}
