// Entity Schema - declarative field and edge definitions for mapped entities
// Each entity type is described once; the record mapper works from these
// descriptors alone, without per-type persistence code.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Internal synthetic identifier assigned by storage on first persist.
pub type EntityId = i64;

/// Loosely-typed record: field name to value.
pub type Record = serde_json::Map<String, Value>;

pub const ID_FIELD: &str = "id";
pub const CHANNEL_FIELD: &str = "channel";
pub const PLATFORM_ID_FIELD: &str = "platformId";
pub const PLATFORM_CREATED_AT_FIELD: &str = "platformCreatedAt";

/// Entity adapter - the explicit per-type registration that replaces
/// convention-based method lookup.
pub trait EntityAdapter: Send + Sync + 'static {
    /// Entity type name, also the storage discriminator
    fn entity_name() -> &'static str;

    /// Scalar fields
    fn fields() -> Vec<FieldDefinition>;

    /// Associations to other entities
    fn edges() -> Vec<EdgeDefinition> {
        Vec::new()
    }

    /// Channeled entities carry `channel`, `platformId` and `platformCreatedAt`
    fn channeled() -> bool {
        false
    }

    /// Scalar that represents the whole entity when it is read as an association element
    fn leaf_field() -> Option<&'static str> {
        None
    }

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new(
            Self::entity_name(),
            Self::channeled(),
            Self::leaf_field(),
            Self::fields(),
            Self::edges(),
        )
    }
}

/// Field types supported by the mapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// RFC 3339, normalized to UTC with second precision
    Time,
    JSON,
    Channel,
}

/// Dedicated storage columns shared by every channeled entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Column {
    Channel,
    PlatformId,
    PlatformCreatedAt,
}

impl Column {
    pub fn sql_name(self) -> &'static str {
        match self {
            Column::Channel => "channel",
            Column::PlatformId => "platform_id",
            Column::PlatformCreatedAt => "platform_created_at",
        }
    }
}

/// Where a field's value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldStorage {
    /// Inside the JSON document of the row
    Data,
    Column(Column),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
    pub storage: FieldStorage,
}

impl FieldDefinition {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            storage: FieldStorage::Data,
        }
    }

    fn column(name: &str, field_type: FieldType, column: Column) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            storage: FieldStorage::Column(column),
        }
    }
}

/// Edge cardinality. Both are stored and read as collections; `One` caps the
/// collection at a single element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeCardinality {
    One,
    Many,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub name: String,
    pub target_entity: String,
    pub cardinality: EdgeCardinality,
    /// At most one target per channel (owner of channel-scoped children)
    pub per_channel: bool,
}

impl EdgeDefinition {
    /// Create a collection edge to another entity
    pub fn to(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            target_entity: target.to_string(),
            cardinality: EdgeCardinality::Many,
            per_channel: false,
        }
    }

    /// Limit the edge to a single element
    pub fn unique(mut self) -> Self {
        self.cardinality = EdgeCardinality::One;
        self
    }

    /// Allow at most one target per channel
    pub fn per_channel(mut self) -> Self {
        self.per_channel = true;
        self
    }
}

/// A field as seen by the mapper
#[derive(Debug, Clone, Copy)]
pub enum FieldRef<'a> {
    Scalar(&'a FieldDefinition),
    Edge(&'a EdgeDefinition),
}

/// Resolved, registration-time view of one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub channeled: bool,
    pub leaf_field: Option<String>,
    fields: Vec<FieldDefinition>,
    edges: Vec<EdgeDefinition>,
}

impl EntityDescriptor {
    pub fn new(
        name: &str,
        channeled: bool,
        leaf_field: Option<&str>,
        fields: Vec<FieldDefinition>,
        edges: Vec<EdgeDefinition>,
    ) -> Self {
        let mut all_fields = Vec::with_capacity(fields.len() + 3);
        if channeled {
            all_fields.push(FieldDefinition::column(CHANNEL_FIELD, FieldType::Channel, Column::Channel));
            all_fields.push(FieldDefinition::column(PLATFORM_ID_FIELD, FieldType::String, Column::PlatformId));
            all_fields.push(FieldDefinition::column(
                PLATFORM_CREATED_AT_FIELD,
                FieldType::Time,
                Column::PlatformCreatedAt,
            ));
        }
        all_fields.extend(fields);

        Self {
            name: name.to_string(),
            channeled,
            leaf_field: leaf_field.map(str::to_string),
            fields: all_fields,
            edges,
        }
    }

    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    pub fn edges(&self) -> &[EdgeDefinition] {
        &self.edges
    }

    pub fn field(&self, name: &str) -> Option<FieldRef<'_>> {
        if let Some(field) = self.fields.iter().find(|f| f.name == name) {
            return Some(FieldRef::Scalar(field));
        }
        self.edges
            .iter()
            .find(|e| e.name == name)
            .map(FieldRef::Edge)
    }

    pub fn edge(&self, name: &str) -> Option<&EdgeDefinition> {
        self.edges.iter().find(|e| e.name == name)
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf_field.is_some()
    }
}

/// What the mapper does with input keys the entity does not declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownFieldPolicy {
    #[default]
    Ignore,
    Reject,
}

impl FromStr for UnknownFieldPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(UnknownFieldPolicy::Ignore),
            "reject" => Ok(UnknownFieldPolicy::Reject),
            other => Err(AppError::ConfigurationError(format!(
                "Unknown field policy '{}', expected 'ignore' or 'reject'",
                other
            ))),
        }
    }
}

impl fmt::Display for UnknownFieldPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnknownFieldPolicy::Ignore => f.write_str("ignore"),
            UnknownFieldPolicy::Reject => f.write_str("reject"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Widget;

    impl EntityAdapter for Widget {
        fn entity_name() -> &'static str {
            "Widget"
        }

        fn fields() -> Vec<FieldDefinition> {
            vec![FieldDefinition::new("label", FieldType::String)]
        }

        fn edges() -> Vec<EdgeDefinition> {
            vec![EdgeDefinition::to("parts", "Part"), EdgeDefinition::to("owner", "Owner").unique()]
        }

        fn channeled() -> bool {
            true
        }
    }

    #[test]
    fn test_channeled_descriptor_gets_platform_columns() {
        let descriptor = Widget::descriptor();
        let names: Vec<&str> = descriptor.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["channel", "platformId", "platformCreatedAt", "label"]);
        assert!(matches!(
            descriptor.field("platformId"),
            Some(FieldRef::Scalar(FieldDefinition {
                storage: FieldStorage::Column(Column::PlatformId),
                ..
            }))
        ));
    }

    #[test]
    fn test_edge_lookup_and_cardinality() {
        let descriptor = Widget::descriptor();
        assert_eq!(descriptor.edge("parts").unwrap().cardinality, EdgeCardinality::Many);
        assert_eq!(descriptor.edge("owner").unwrap().cardinality, EdgeCardinality::One);
        assert!(descriptor.field("missing").is_none());
    }

    #[test]
    fn test_unknown_field_policy_parsing() {
        assert_eq!("Reject".parse::<UnknownFieldPolicy>().unwrap(), UnknownFieldPolicy::Reject);
        assert_eq!("ignore".parse::<UnknownFieldPolicy>().unwrap(), UnknownFieldPolicy::Ignore);
        assert!("strict".parse::<UnknownFieldPolicy>().is_err());
    }
}
