//! Schema descriptors handed to the engine at open time.
//!
//! Schema generation (per-class reflection glue) happens upstream of this
//! crate; by the time a database is opened the schema is a plain list of
//! type descriptors.

use crate::value::FieldType;

/// Schema for one object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSchema {
    /// Type name, unique within the database.
    pub name: String,
    /// Declared fields: (property name, field type).
    pub fields: Vec<(String, FieldType)>,
}

impl TypeSchema {
    /// Creates a schema descriptor for a type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Adds a field to the schema.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push((name.into(), field_type));
        self
    }

    /// Looks up the declared type of a property.
    #[must_use]
    pub fn field_type(&self, property: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|(name, _)| name == property)
            .map(|(_, ft)| *ft)
    }
}

/// Configuration for opening a database through the engine boundary.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Database name, used for diagnostics only.
    pub name: String,
    /// Declared object types.
    pub schema: Vec<TypeSchema>,
}

impl EngineConfig {
    /// Creates a configuration with the given database name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: Vec::new(),
        }
    }

    /// Adds an object type to the schema.
    #[must_use]
    pub fn with_type(mut self, schema: TypeSchema) -> Self {
        self.schema.push(schema);
        self
    }

    /// Looks up the schema for a type name.
    #[must_use]
    pub fn type_schema(&self, type_name: &str) -> Option<&TypeSchema> {
        self.schema.iter().find(|t| t.name == type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_lookup() {
        let schema = TypeSchema::new("Person")
            .field("name", FieldType::Str)
            .field("age", FieldType::Int);

        assert_eq!(schema.field_type("name"), Some(FieldType::Str));
        assert_eq!(schema.field_type("age"), Some(FieldType::Int));
        assert_eq!(schema.field_type("missing"), None);
    }

    #[test]
    fn config_type_lookup() {
        let config = EngineConfig::new("test")
            .with_type(TypeSchema::new("Person").field("name", FieldType::Str));

        assert!(config.type_schema("Person").is_some());
        assert!(config.type_schema("Dog").is_none());
    }
}
