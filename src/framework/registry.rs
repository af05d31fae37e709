//! Registry of mapped entity types.
//!
//! Every entity type is registered once, up front. Registration resolves
//! the field and edge definitions into an [`EntityDescriptor`] and checks the
//! whole graph for consistency, so the record mapper never has to discover
//! structure at request time.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::framework::entity::{EntityAdapter, EntityDescriptor, FieldType, ID_FIELD};

/// Entity and field names end up in SQL JSON paths and cache keys.
static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("identifier pattern is valid")
});

/// Immutable lookup of entity descriptors by name.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    descriptors: HashMap<String, Arc<EntityDescriptor>>,
}

impl EntityRegistry {
    pub fn builder() -> EntityRegistryBuilder {
        EntityRegistryBuilder::default()
    }

    /// Retrieves the descriptor for an entity type.
    pub fn descriptor(&self, name: &str) -> AppResult<Arc<EntityDescriptor>> {
        self.descriptors
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::ConfigurationError(format!("Unknown entity type '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    /// Registered entity names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.descriptors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, Default)]
pub struct EntityRegistryBuilder {
    descriptors: Vec<EntityDescriptor>,
}

impl EntityRegistryBuilder {
    pub fn register<T: EntityAdapter>(self) -> Self {
        self.register_descriptor(T::descriptor())
    }

    pub fn register_descriptor(mut self, descriptor: EntityDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Validate the graph and freeze it. All problems are reported together.
    pub fn build(self) -> AppResult<EntityRegistry> {
        let mut errors = Vec::new();
        let mut descriptors: HashMap<String, Arc<EntityDescriptor>> = HashMap::new();

        for descriptor in self.descriptors {
            if descriptors.contains_key(&descriptor.name) {
                errors.push(format!("Entity '{}' is registered twice", descriptor.name));
                continue;
            }
            descriptors.insert(descriptor.name.clone(), Arc::new(descriptor));
        }

        for descriptor in descriptors.values() {
            validate_descriptor(descriptor, &descriptors, &mut errors);
        }

        if errors.is_empty() {
            Ok(EntityRegistry { descriptors })
        } else {
            errors.sort();
            Err(AppError::ConfigurationError(errors.join("; ")))
        }
    }
}

fn validate_descriptor(
    descriptor: &EntityDescriptor,
    all: &HashMap<String, Arc<EntityDescriptor>>,
    errors: &mut Vec<String>,
) {
    let entity = &descriptor.name;
    if !IDENTIFIER.is_match(entity) {
        errors.push(format!("Entity name '{}' is not a valid identifier", entity));
    }

    let mut seen: Vec<&str> = Vec::new();
    let names = descriptor
        .fields()
        .iter()
        .map(|f| f.name.as_str())
        .chain(descriptor.edges().iter().map(|e| e.name.as_str()));
    for name in names {
        if !IDENTIFIER.is_match(name) {
            errors.push(format!("Field '{}' on {} is not a valid identifier", name, entity));
        }
        if name == ID_FIELD {
            errors.push(format!("Field 'id' on {} is reserved", entity));
        }
        if seen.contains(&name) {
            errors.push(format!("Field '{}' is declared twice on {}", name, entity));
        }
        seen.push(name);
    }

    for edge in descriptor.edges() {
        let Some(target) = all.get(&edge.target_entity) else {
            errors.push(format!(
                "Entity {} has edge '{}' pointing to undefined entity {}",
                entity, edge.name, edge.target_entity
            ));
            continue;
        };
        if edge.per_channel && (descriptor.channeled || !target.channeled) {
            errors.push(format!(
                "Per-channel edge '{}' on {} must link a non-channeled owner to a channeled target",
                edge.name, entity
            ));
        }
    }

    if let Some(leaf) = &descriptor.leaf_field {
        let is_scalar = descriptor
            .fields()
            .iter()
            .any(|f| &f.name == leaf && f.field_type != FieldType::Channel);
        if !is_scalar {
            errors.push(format!("Leaf field '{}' on {} is not a scalar field", leaf, entity));
        }
        if !descriptor.edges().is_empty() {
            errors.push(format!("Leaf entity {} cannot declare edges", entity));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::entity::{EdgeDefinition, FieldDefinition};

    fn entity(name: &str, channeled: bool, edges: Vec<EdgeDefinition>) -> EntityDescriptor {
        EntityDescriptor::new(
            name,
            channeled,
            None,
            vec![FieldDefinition::new("name", FieldType::String)],
            edges,
        )
    }

    #[test]
    fn test_build_resolves_targets() {
        let registry = EntityRegistry::builder()
            .register_descriptor(entity("Owner", false, vec![EdgeDefinition::to("items", "Item").per_channel()]))
            .register_descriptor(entity("Item", true, vec![]))
            .build()
            .unwrap();

        assert_eq!(registry.names(), vec!["Item", "Owner"]);
        assert_eq!(registry.descriptor("Owner").unwrap().edges()[0].target_entity, "Item");
        assert!(matches!(registry.descriptor("Ghost"), Err(AppError::ConfigurationError(_))));
    }

    #[test]
    fn test_build_reports_every_problem() {
        let err = EntityRegistry::builder()
            .register_descriptor(entity("Owner", false, vec![EdgeDefinition::to("items", "Missing")]))
            .register_descriptor(entity("Owner", false, vec![]))
            .register_descriptor(entity("bad-name", false, vec![]))
            .build()
            .unwrap_err();

        let AppError::ConfigurationError(msg) = err else {
            panic!("expected configuration error");
        };
        assert!(msg.contains("registered twice"));
        assert!(msg.contains("undefined entity Missing"));
        assert!(msg.contains("'bad-name' is not a valid identifier"));
    }

    #[test]
    fn test_per_channel_edge_requires_channeled_target() {
        let err = EntityRegistry::builder()
            .register_descriptor(entity("Owner", false, vec![EdgeDefinition::to("items", "Item").per_channel()]))
            .register_descriptor(entity("Item", false, vec![]))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Per-channel edge 'items'"));
    }

    #[test]
    fn test_leaf_entities_are_checked() {
        let leaf = EntityDescriptor::new(
            "Tag",
            false,
            Some("label"),
            vec![FieldDefinition::new("name", FieldType::String)],
            vec![],
        );
        let err = EntityRegistry::builder().register_descriptor(leaf).build().unwrap_err();
        assert!(err.to_string().contains("Leaf field 'label'"));
    }
}
