// Catalog Entity Schemas - channel-independent records
// A Product or Vendor groups the per-channel copies imported from each platform.

use crate::framework::entity::{EdgeDefinition, EntityAdapter, FieldDefinition, FieldType};

/// Canonical product, one per SKU
pub struct Product;

impl EntityAdapter for Product {
    fn entity_name() -> &'static str {
        "Product"
    }

    fn fields() -> Vec<FieldDefinition> {
        vec![
            FieldDefinition::new("sku", FieldType::String),
            FieldDefinition::new("name", FieldType::String),
        ]
    }

    fn edges() -> Vec<EdgeDefinition> {
        vec![
            // At most one listing per channel
            EdgeDefinition::to("channeledProducts", "ChanneledProduct").per_channel(),
        ]
    }
}

pub struct Vendor;

impl EntityAdapter for Vendor {
    fn entity_name() -> &'static str {
        "Vendor"
    }

    fn fields() -> Vec<FieldDefinition> {
        vec![FieldDefinition::new("name", FieldType::String)]
    }

    fn edges() -> Vec<EdgeDefinition> {
        vec![EdgeDefinition::to("channeledVendors", "ChanneledVendor").per_channel()]
    }
}

/// Free-form label; read back as its name
pub struct Tag;

impl EntityAdapter for Tag {
    fn entity_name() -> &'static str {
        "Tag"
    }

    fn fields() -> Vec<FieldDefinition> {
        vec![FieldDefinition::new("name", FieldType::String)]
    }

    fn leaf_field() -> Option<&'static str> {
        Some("name")
    }
}
