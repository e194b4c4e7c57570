//! Boundary validation and mock-input sampling.
//!
//! Actions carry typed input/output shapes. A [`SchemaCodec`] erases the
//! type while preserving its behaviour: validation is a serde round-trip
//! through the typed shape (which also coerces, e.g. missing optional
//! fields), and the JSON schema from `schemars` feeds a deterministic
//! sampler that produces the mock inputs surfaced by
//! `get_actions_metadata`.

use schemars::schema::{InstanceType, RootSchema, Schema, SchemaObject, SingleOrVec};
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::error::ValidationError;

/// Recursion guard for self-referential schemas.
const MAX_SAMPLE_DEPTH: usize = 8;

type ValidateFn =
    Arc<dyn Fn(&serde_json::Value) -> Result<serde_json::Value, ValidationError> + Send + Sync>;

/// Type-erased validator and sampler for one value shape.
#[derive(Clone)]
pub struct SchemaCodec {
    schema: RootSchema,
    validate: ValidateFn,
    mock: serde_json::Value,
}

impl SchemaCodec {
    /// Build a codec from a typed shape.
    pub fn of<T>() -> Self
    where
        T: Serialize + DeserializeOwned + JsonSchema,
    {
        let schema = schema_for!(T);
        let mock = sample_root(&schema);
        let validate: ValidateFn = Arc::new(|value| {
            let typed: T = serde_json::from_value(value.clone())
                .map_err(|e| ValidationError::new(e.to_string()))?;
            serde_json::to_value(typed).map_err(|e| ValidationError::new(e.to_string()))
        });
        Self {
            schema,
            validate,
            mock,
        }
    }

    /// Whether the shape is a JSON object, as required at action
    /// registration for inputs and outputs.
    pub fn describes_object(&self) -> bool {
        schema_is_object(&self.schema.schema, &self.schema)
    }

    /// Validate and coerce a value through the typed shape.
    pub fn validate(&self, value: &serde_json::Value) -> Result<serde_json::Value, ValidationError> {
        (self.validate)(value)
    }

    /// The deterministic sample computed at construction.
    pub fn mock(&self) -> &serde_json::Value {
        &self.mock
    }

    /// The underlying JSON schema.
    pub fn schema(&self) -> &RootSchema {
        &self.schema
    }
}

impl std::fmt::Debug for SchemaCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCodec")
            .field("describes_object", &self.describes_object())
            .finish_non_exhaustive()
    }
}

fn schema_is_object(schema: &SchemaObject, root: &RootSchema) -> bool {
    if let Some(reference) = &schema.reference {
        return resolve_ref(reference, root)
            .map(|s| match s {
                Schema::Object(obj) => schema_is_object(obj, root),
                Schema::Bool(_) => false,
            })
            .unwrap_or(false);
    }
    if schema.object.is_some() {
        return true;
    }
    match &schema.instance_type {
        Some(SingleOrVec::Single(t)) => **t == InstanceType::Object,
        Some(SingleOrVec::Vec(ts)) => ts.contains(&InstanceType::Object),
        None => false,
    }
}

fn resolve_ref<'a>(reference: &str, root: &'a RootSchema) -> Option<&'a Schema> {
    let name = reference.strip_prefix("#/definitions/")?;
    root.definitions.get(name)
}

fn sample_root(root: &RootSchema) -> serde_json::Value {
    sample_object(&root.schema, root, 0)
}

fn sample_schema(schema: &Schema, root: &RootSchema, depth: usize) -> serde_json::Value {
    match schema {
        Schema::Bool(_) => serde_json::Value::Null,
        Schema::Object(obj) => sample_object(obj, root, depth),
    }
}

/// Deterministic sample: first enum value, zero for numbers, empty string,
/// empty array, recursively sampled properties for objects.
fn sample_object(schema: &SchemaObject, root: &RootSchema, depth: usize) -> serde_json::Value {
    if depth > MAX_SAMPLE_DEPTH {
        return serde_json::Value::Null;
    }
    if let Some(reference) = &schema.reference {
        return resolve_ref(reference, root)
            .map(|s| sample_schema(s, root, depth + 1))
            .unwrap_or(serde_json::Value::Null);
    }
    if let Some(values) = &schema.enum_values {
        if let Some(first) = values.first() {
            return first.clone();
        }
    }
    if let Some(constant) = &schema.const_value {
        return constant.clone();
    }
    if let Some(subschemas) = &schema.subschemas {
        let first = subschemas
            .all_of
            .as_ref()
            .or(subschemas.any_of.as_ref())
            .or(subschemas.one_of.as_ref())
            .and_then(|list| list.first());
        if let Some(schema) = first {
            return sample_schema(schema, root, depth + 1);
        }
    }

    let instance = match &schema.instance_type {
        Some(SingleOrVec::Single(t)) => Some(**t),
        Some(SingleOrVec::Vec(ts)) => ts.iter().copied().find(|t| *t != InstanceType::Null),
        None => None,
    };

    match instance {
        Some(InstanceType::Object) => {
            let mut map = serde_json::Map::new();
            if let Some(object) = &schema.object {
                for (key, prop) in &object.properties {
                    map.insert(key.clone(), sample_schema(prop, root, depth + 1));
                }
            }
            serde_json::Value::Object(map)
        }
        Some(InstanceType::Array) => serde_json::Value::Array(Vec::new()),
        Some(InstanceType::String) => serde_json::Value::String(String::new()),
        Some(InstanceType::Integer) | Some(InstanceType::Number) => {
            serde_json::Value::Number(0.into())
        }
        Some(InstanceType::Boolean) => serde_json::Value::Bool(false),
        Some(InstanceType::Null) | None => serde_json::Value::Null,
    }
}
