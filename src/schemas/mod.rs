// Schema definitions module - the commerce entity graph and its repositories

pub mod catalog_schemas;
pub mod channeled_schemas;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::ChannelArg;
use crate::error::AppResult;
use crate::framework::entity::EntityAdapter;
use crate::framework::{ChanneledStore, EntityRegistry, Record, RecordMapper, Repository, Store};

pub use catalog_schemas::{Product, Tag, Vendor};
pub use channeled_schemas::{
    ChanneledDiscount, ChanneledOrder, ChanneledProduct, ChanneledProductCategory,
    ChanneledProductVariant, ChanneledVendor,
};

/// Register and validate every commerce entity
pub fn commerce_registry() -> AppResult<EntityRegistry> {
    EntityRegistry::builder()
        .register::<Product>()
        .register::<Vendor>()
        .register::<Tag>()
        .register::<ChanneledVendor>()
        .register::<ChanneledProductCategory>()
        .register::<ChanneledProduct>()
        .register::<ChanneledProductVariant>()
        .register::<ChanneledDiscount>()
        .register::<ChanneledOrder>()
        .build()
}

/// Repositories by entity name
pub type RepositoryMap = HashMap<String, Arc<dyn Repository>>;

/// One repository per registered entity. Channeled types get a
/// [`ChanneledStore`], the rest a plain [`Store`].
pub fn commerce_repositories(mapper: &Arc<RecordMapper>) -> AppResult<RepositoryMap> {
    let mut repositories = RepositoryMap::new();
    add_store::<Product>(&mut repositories, mapper)?;
    add_store::<Vendor>(&mut repositories, mapper)?;
    add_store::<Tag>(&mut repositories, mapper)?;
    add_channeled::<ChanneledVendor>(&mut repositories, mapper)?;
    add_channeled::<ChanneledProductCategory>(&mut repositories, mapper)?;
    add_channeled::<ChanneledProduct>(&mut repositories, mapper)?;
    add_channeled::<ChanneledProductVariant>(&mut repositories, mapper)?;
    add_channeled::<ChanneledDiscount>(&mut repositories, mapper)?;
    add_channeled::<ChanneledOrder>(&mut repositories, mapper)?;
    Ok(repositories)
}

fn add_store<T: EntityAdapter>(repositories: &mut RepositoryMap, mapper: &Arc<RecordMapper>) -> AppResult<()> {
    let store = Store::<T>::new(Arc::clone(mapper))?;
    repositories.insert(T::entity_name().to_string(), Arc::new(store));
    Ok(())
}

fn add_channeled<T: EntityAdapter>(repositories: &mut RepositoryMap, mapper: &Arc<RecordMapper>) -> AppResult<()> {
    let store = ChanneledStore::new(Store::<T>::new(Arc::clone(mapper))?)?;
    repositories.insert(T::entity_name().to_string(), Arc::new(store));
    Ok(())
}

impl ChanneledStore<ChanneledDiscount> {
    /// Discount with the given code in the channel
    pub async fn get_by_code(&self, code: &str, channel: impl Into<ChannelArg>) -> AppResult<Option<Record>> {
        self.get_by_field("code", Value::from(code), channel).await
    }
}
