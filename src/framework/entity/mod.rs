// Entity model - schema declarations and field binding

pub mod binding;
pub mod schema;

pub use binding::{association_ids, coerce_scalar, parse_timestamp, EntityDraft};
pub use schema::{
    Column, EdgeCardinality, EdgeDefinition, EntityAdapter, EntityDescriptor, EntityId,
    FieldDefinition, FieldRef, FieldStorage, FieldType, Record, UnknownFieldPolicy,
    CHANNEL_FIELD, ID_FIELD, PLATFORM_CREATED_AT_FIELD, PLATFORM_ID_FIELD,
};
