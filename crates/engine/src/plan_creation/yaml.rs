//! YAML helpers for plan assembly.
//!
//! Every mapping of a pipeline document carries a stable id under
//! [`UUID_KEY`] once [`inject_uuids`] ran.  A [`YamlField`] is one named
//! fragment of the document still waiting to be turned into plan nodes.

use std::collections::BTreeMap;

use serde_yaml::{Mapping, Value};

use crate::EngineError;

pub const UUID_KEY: &str = "__uuid";

/// A named YAML fragment plus the string metadata its creator was given.
#[derive(Debug, Clone, PartialEq)]
pub struct YamlField {
    pub name: String,
    pub uuid: String,
    pub node: Value,
    pub metadata: BTreeMap<String, String>,
}

impl YamlField {
    /// Field named `name` whose value is `node`.  Mappings use their own
    /// injected id; other values use `fallback_uuid`.
    pub fn new(name: impl Into<String>, node: Value, fallback_uuid: impl Into<String>) -> Self {
        let uuid = uuid_of(&node)
            .map(str::to_owned)
            .unwrap_or_else(|| fallback_uuid.into());
        Self {
            name: name.into(),
            uuid,
            node,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.node.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.node.get(key).and_then(Value::as_str)
    }

    /// `key` as a string, or an [`EngineError::InvalidYaml`] naming the field.
    pub fn require_str(&self, key: &str) -> Result<&str, EngineError> {
        self.get_str(key).ok_or_else(|| {
            EngineError::InvalidYaml(format!("`{}` ({}) requires a string `{key}`", self.name, self.uuid))
        })
    }
}

pub fn parse_document(content: &str) -> Result<Value, EngineError> {
    serde_yaml::from_str(content).map_err(|e| EngineError::InvalidYaml(e.to_string()))
}

/// Give every mapping of `value` a [`UUID_KEY`]; existing ids are kept.
pub fn inject_uuids(value: &mut Value) {
    match value {
        Value::Mapping(mapping) => {
            if !mapping.contains_key(UUID_KEY) {
                mapping.insert(
                    Value::String(UUID_KEY.to_owned()),
                    Value::String(uuid::Uuid::new_v4().to_string()),
                );
            }
            for (_, child) in mapping.iter_mut() {
                inject_uuids(child);
            }
        }
        Value::Sequence(items) => items.iter_mut().for_each(inject_uuids),
        Value::Tagged(tagged) => inject_uuids(&mut tagged.value),
        _ => {}
    }
}

/// Copy of `value` without any [`UUID_KEY`] entries.
pub fn strip_uuids(value: &Value) -> Value {
    match value {
        Value::Mapping(mapping) => Value::Mapping(
            mapping
                .iter()
                .filter(|(k, _)| k.as_str() != Some(UUID_KEY))
                .map(|(k, v)| (k.clone(), strip_uuids(v)))
                .collect::<Mapping>(),
        ),
        Value::Sequence(items) => Value::Sequence(items.iter().map(strip_uuids).collect()),
        other => other.clone(),
    }
}

pub fn uuid_of(value: &Value) -> Option<&str> {
    value.get(UUID_KEY).and_then(Value::as_str)
}

/// The single `key: value` entry of a wrapper mapping such as `{step: {...}}`.
pub fn single_entry(wrapper: &Value) -> Result<(String, Value), EngineError> {
    let mapping = wrapper
        .as_mapping()
        .ok_or_else(|| EngineError::InvalidYaml(format!("expected a mapping, got {wrapper:?}")))?;
    let mut entries = mapping
        .iter()
        .filter(|(k, _)| k.as_str() != Some(UUID_KEY));
    match (entries.next(), entries.next()) {
        (Some((key, value)), None) => {
            let key = key
                .as_str()
                .ok_or_else(|| EngineError::InvalidYaml(format!("non-string key {key:?}")))?;
            Ok((key.to_owned(), value.clone()))
        }
        _ => Err(EngineError::InvalidYaml(
            "expected exactly one field in wrapper mapping".into(),
        )),
    }
}

/// Field for one wrapper mapping, e.g. a list item `{stage: {...}}` or the
/// whole document `{pipeline: {...}}`.  A non-mapping value (a `parallel`
/// list) takes the wrapper's id.
pub fn wrapped_field(wrapper: &Value) -> Result<YamlField, EngineError> {
    let (name, node) = single_entry(wrapper)?;
    let fallback = uuid_of(wrapper)
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    Ok(YamlField::new(name, node, fallback))
}
