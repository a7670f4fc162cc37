//! Layered key/value configuration and its deterministic merge.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::schema::{Field, Shape};
use crate::types::Described;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvConfigField {
    pub key: String,
    pub value: Value,
}

/// A flat set of configuration keys. Merge output is sorted by key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KvConfig {
    pub fields: Vec<KvConfigField>,
}

impl KvConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Replaces the value of an existing key or appends a new one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|field| field.key == key) {
            Some(field) => field.value = value,
            None => self.fields.push(KvConfigField { key, value }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|field| field.key == key)
            .map(|field| &field.value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.key.as_str())
    }
}

impl Described for KvConfig {
    fn shape() -> Shape {
        Shape::object(vec![Field::required(
            "fields",
            Shape::array(Shape::object(vec![
                Field::required("key", Shape::String),
                Field::required("value", Shape::Any),
            ])),
        )])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvConfigStackLayer {
    pub layer_name: String,
    pub config: KvConfig,
}

/// Ordered layers, lowest precedence first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KvConfigStack {
    pub layers: Vec<KvConfigStackLayer>,
}

impl KvConfigStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, layer_name: impl Into<String>, config: KvConfig) -> Self {
        self.push_layer(layer_name, config);
        self
    }

    pub fn push_layer(&mut self, layer_name: impl Into<String>, config: KvConfig) {
        self.layers.push(KvConfigStackLayer {
            layer_name: layer_name.into(),
            config,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Described for KvConfigStack {
    fn shape() -> Shape {
        Shape::object(vec![Field::required(
            "layers",
            Shape::array(Shape::object(vec![
                Field::required("layerName", Shape::String),
                Field::required("config", KvConfig::shape()),
            ])),
        )])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigMergeError {
    #[error("Layer {layer_index} ({layer_name}) contains an empty key")]
    EmptyKey {
        layer_index: usize,
        layer_name: String,
    },

    #[error("Layer {layer_index} ({layer_name}) sets {key} more than once")]
    DuplicateKey {
        layer_index: usize,
        layer_name: String,
        key: String,
    },
}

impl ConfigMergeError {
    /// Field path of the offending layer, relative to the stack.
    pub fn path(&self) -> String {
        match self {
            ConfigMergeError::EmptyKey { layer_index, .. }
            | ConfigMergeError::DuplicateKey { layer_index, .. } => {
                format!("layers[{layer_index}].config.fields")
            }
        }
    }
}

/// Merges layers by precedence: a later layer's key overrides an earlier one.
pub fn merge(stack: &KvConfigStack) -> Result<KvConfig, ConfigMergeError> {
    merge_with_defaults(&KvConfig::default(), stack)
}

/// Same as [`merge`] with `defaults` acting as the lowest layer, so every key
/// the defaults name resolves to a value.
pub fn merge_with_defaults(
    defaults: &KvConfig,
    stack: &KvConfigStack,
) -> Result<KvConfig, ConfigMergeError> {
    let mut resolved: BTreeMap<String, Value> = defaults
        .fields
        .iter()
        .map(|field| (field.key.clone(), field.value.clone()))
        .collect();

    for (layer_index, layer) in stack.layers.iter().enumerate() {
        let mut seen = HashSet::new();
        for field in &layer.config.fields {
            if field.key.is_empty() {
                return Err(ConfigMergeError::EmptyKey {
                    layer_index,
                    layer_name: layer.layer_name.clone(),
                });
            }
            if !seen.insert(field.key.as_str()) {
                return Err(ConfigMergeError::DuplicateKey {
                    layer_index,
                    layer_name: layer.layer_name.clone(),
                    key: field.key.clone(),
                });
            }
            resolved.insert(field.key.clone(), field.value.clone());
        }
    }

    Ok(KvConfig {
        fields: resolved
            .into_iter()
            .map(|(key, value)| KvConfigField { key, value })
            .collect(),
    })
}
