//! Schema registry and structural validation of workflow states.
//!
//! States carry a `SchemaRef` naming the schema they claim to conform to.
//! Validation is mechanical: required fields must be present and every
//! present field must match its declared kind.

use crate::error::{Result, StoreError};
use crate::types::{SchemaRef, WorkflowState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Expected JSON kind of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKind {
    Any,
    String,
    Number,
    Bool,
    Object,
    Array,
}

impl FieldKind {
    fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            FieldKind::Any => true,
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }
}

/// Declaration of a single field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(kind: FieldKind) -> Self {
        FieldSpec { kind, required: true }
    }

    pub fn optional(kind: FieldKind) -> Self {
        FieldSpec { kind, required: false }
    }

    fn matches(&self, value: &serde_json::Value) -> bool {
        self.kind.matches(value)
    }
}

/// A versioned state schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateSchema {
    pub id: String,
    pub version: u32,
    pub fields: BTreeMap<String, FieldSpec>,
    /// Accept fields not listed in `fields`.
    pub allow_unknown: bool,
}

impl StateSchema {
    /// Schema that accepts any well-formed field map.
    pub fn permissive(id: impl Into<String>, version: u32) -> Self {
        StateSchema {
            id: id.into(),
            version,
            fields: BTreeMap::new(),
            allow_unknown: true,
        }
    }

    pub fn schema_ref(&self) -> SchemaRef {
        SchemaRef::new(self.id.clone(), self.version)
    }

    /// Builder-style field declaration.
    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    fn validate(&self, state: &WorkflowState) -> Result<()> {
        for (name, spec) in &self.fields {
            match state.fields.get(name) {
                Some(value) => {
                    if !spec.matches(value) {
                        return Err(StoreError::Validation(format!(
                            "field '{name}' does not match declared kind {:?}",
                            spec.kind
                        )));
                    }
                }
                None if spec.required => {
                    return Err(StoreError::Validation(format!(
                        "required field '{name}' is missing"
                    )));
                }
                None => {}
            }
        }
        if !self.allow_unknown {
            for name in state.fields.keys() {
                if !self.fields.contains_key(name) {
                    return Err(StoreError::Validation(format!(
                        "unknown field '{name}' not allowed by schema {}/{}",
                        self.id, self.version
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Default schema id registered by the store.
pub const DEFAULT_SCHEMA_ID: &str = "workflow";

/// Default schema version registered by the store.
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

/// In-process registry of known schemas.
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<(String, u32), StateSchema>>,
}

impl SchemaRegistry {
    /// Registry pre-seeded with the permissive default schema.
    pub fn with_default() -> Self {
        let registry = SchemaRegistry {
            schemas: RwLock::new(HashMap::new()),
        };
        registry.register(StateSchema::permissive(
            DEFAULT_SCHEMA_ID,
            DEFAULT_SCHEMA_VERSION,
        ));
        registry
    }

    /// Register or replace a schema.
    pub fn register(&self, schema: StateSchema) {
        self.schemas
            .write()
            .insert((schema.id.clone(), schema.version), schema);
    }

    pub fn contains(&self, schema_ref: &SchemaRef) -> bool {
        self.schemas
            .read()
            .contains_key(&(schema_ref.id.clone(), schema_ref.version))
    }

    /// Validate a state against its declared schema.
    ///
    /// Runs before any persistence attempt; a failure here never leaves a
    /// trace in the store.
    pub fn validate(&self, state: &WorkflowState) -> Result<()> {
        for name in state.fields.keys() {
            if name.is_empty() {
                return Err(StoreError::Validation("empty field name".into()));
            }
        }
        let schemas = self.schemas.read();
        let schema = schemas
            .get(&(state.schema.id.clone(), state.schema.version))
            .ok_or_else(|| {
                StoreError::Validation(format!(
                    "unknown schema {}/{}",
                    state.schema.id, state.schema.version
                ))
            })?;
        schema.validate(state)
    }
}

/// The default schema reference accepted by a fresh store.
pub fn default_schema_ref() -> SchemaRef {
    SchemaRef::new(DEFAULT_SCHEMA_ID, DEFAULT_SCHEMA_VERSION)
}
