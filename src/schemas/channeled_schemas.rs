// Channeled Entity Schemas - records as imported from one source platform
// Every type here also carries channel, platformId and platformCreatedAt.

use crate::framework::entity::{EdgeDefinition, EntityAdapter, FieldDefinition, FieldType};

pub struct ChanneledVendor;

impl EntityAdapter for ChanneledVendor {
    fn entity_name() -> &'static str {
        "ChanneledVendor"
    }

    fn fields() -> Vec<FieldDefinition> {
        vec![FieldDefinition::new("name", FieldType::String)]
    }

    fn channeled() -> bool {
        true
    }
}

pub struct ChanneledProductCategory;

impl EntityAdapter for ChanneledProductCategory {
    fn entity_name() -> &'static str {
        "ChanneledProductCategory"
    }

    fn fields() -> Vec<FieldDefinition> {
        vec![
            FieldDefinition::new("name", FieldType::String),
            FieldDefinition::new("handle", FieldType::String),
        ]
    }

    fn channeled() -> bool {
        true
    }
}

/// A product listing on one platform
pub struct ChanneledProduct;

impl EntityAdapter for ChanneledProduct {
    fn entity_name() -> &'static str {
        "ChanneledProduct"
    }

    fn fields() -> Vec<FieldDefinition> {
        vec![
            FieldDefinition::new("title", FieldType::String),
            FieldDefinition::new("handle", FieldType::String),
            FieldDefinition::new("status", FieldType::String),
            FieldDefinition::new("productType", FieldType::String),
            // Raw platform payload
            FieldDefinition::new("data", FieldType::JSON),
        ]
    }

    fn edges() -> Vec<EdgeDefinition> {
        vec![
            EdgeDefinition::to("product", "Product").unique(),
            EdgeDefinition::to("channeledVendor", "ChanneledVendor").unique(),
            EdgeDefinition::to("channeledProductCategories", "ChanneledProductCategory"),
            EdgeDefinition::to("channeledProductVariants", "ChanneledProductVariant"),
            EdgeDefinition::to("tags", "Tag"),
        ]
    }

    fn channeled() -> bool {
        true
    }
}

pub struct ChanneledProductVariant;

impl EntityAdapter for ChanneledProductVariant {
    fn entity_name() -> &'static str {
        "ChanneledProductVariant"
    }

    fn fields() -> Vec<FieldDefinition> {
        vec![
            FieldDefinition::new("sku", FieldType::String),
            FieldDefinition::new("title", FieldType::String),
            FieldDefinition::new("price", FieldType::Float),
            FieldDefinition::new("inventoryQuantity", FieldType::Int),
        ]
    }

    fn edges() -> Vec<EdgeDefinition> {
        vec![EdgeDefinition::to("channeledProduct", "ChanneledProduct").unique()]
    }

    fn channeled() -> bool {
        true
    }
}

pub struct ChanneledDiscount;

impl EntityAdapter for ChanneledDiscount {
    fn entity_name() -> &'static str {
        "ChanneledDiscount"
    }

    fn fields() -> Vec<FieldDefinition> {
        vec![
            FieldDefinition::new("code", FieldType::String),
            FieldDefinition::new("valueType", FieldType::String),
            FieldDefinition::new("value", FieldType::Float),
            FieldDefinition::new("startsAt", FieldType::Time),
            FieldDefinition::new("endsAt", FieldType::Time),
        ]
    }

    fn channeled() -> bool {
        true
    }
}

pub struct ChanneledOrder;

impl EntityAdapter for ChanneledOrder {
    fn entity_name() -> &'static str {
        "ChanneledOrder"
    }

    fn fields() -> Vec<FieldDefinition> {
        vec![
            FieldDefinition::new("orderNumber", FieldType::String),
            FieldDefinition::new("currency", FieldType::String),
            FieldDefinition::new("totalPrice", FieldType::Float),
            FieldDefinition::new("financialStatus", FieldType::String),
        ]
    }

    fn edges() -> Vec<EdgeDefinition> {
        vec![
            EdgeDefinition::to("channeledProducts", "ChanneledProduct"),
            EdgeDefinition::to("channeledDiscounts", "ChanneledDiscount"),
        ]
    }

    fn channeled() -> bool {
        true
    }
}
