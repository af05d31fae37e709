// Repository - object-safe contract shared by every store, so callers can
// dispatch on an entity name without knowing its Rust type.

use async_trait::async_trait;

use crate::core::ChannelArg;
use crate::error::{AppError, AppResult};
use crate::framework::entity::{EntityAdapter, EntityId, Record};
use crate::framework::mapper::{LinkOwner, ListQuery};
use crate::framework::store::Store;

fn not_channeled(entity: &str) -> AppError {
    AppError::ConfigurationError(format!("Entity {} is not channeled", entity))
}

#[async_trait]
pub trait Repository: Send + Sync {
    fn entity_name(&self) -> &str;

    fn is_channeled(&self) -> bool {
        false
    }

    async fn create(&self, data: &Record) -> AppResult<Option<Record>>;

    async fn read(
        &self,
        id: EntityId,
        with_associations: bool,
        filters: Option<&Record>,
    ) -> AppResult<Option<Record>>;

    /// `None` when the entity does not exist
    async fn update(&self, id: EntityId, data: &Record) -> AppResult<Option<Record>>;

    async fn delete(&self, id: EntityId) -> AppResult<bool>;

    async fn read_multiple(&self, query: &ListQuery) -> AppResult<Vec<Record>>;

    async fn count_elements(&self, filters: Option<&Record>) -> AppResult<i64>;

    /// Entities that embed `id` through one of their collections
    async fn link_owners(&self, id: EntityId) -> AppResult<Vec<LinkOwner>>;

    async fn exists_by_platform_id(&self, _platform_id: &str, _channel: ChannelArg) -> AppResult<bool> {
        Err(not_channeled(self.entity_name()))
    }

    async fn get_by_platform_id(&self, _platform_id: &str, _channel: ChannelArg) -> AppResult<Option<Record>> {
        Err(not_channeled(self.entity_name()))
    }

    async fn get_last_by_platform_id(&self, _channel: ChannelArg) -> AppResult<Option<Record>> {
        Err(not_channeled(self.entity_name()))
    }

    async fn get_last_by_platform_created_at(&self, _channel: ChannelArg) -> AppResult<Option<Record>> {
        Err(not_channeled(self.entity_name()))
    }

    async fn upsert(&self, _data: &Record) -> AppResult<Option<Record>> {
        Err(not_channeled(self.entity_name()))
    }
}

#[async_trait]
impl<T: EntityAdapter> Repository for Store<T> {
    fn entity_name(&self) -> &str {
        &self.descriptor().name
    }

    async fn create(&self, data: &Record) -> AppResult<Option<Record>> {
        Store::create(self, data).await
    }

    async fn read(
        &self,
        id: EntityId,
        with_associations: bool,
        filters: Option<&Record>,
    ) -> AppResult<Option<Record>> {
        Store::read(self, id, with_associations, filters).await
    }

    async fn update(&self, id: EntityId, data: &Record) -> AppResult<Option<Record>> {
        Store::update(self, id, data).await
    }

    async fn delete(&self, id: EntityId) -> AppResult<bool> {
        Store::delete(self, id).await
    }

    async fn read_multiple(&self, query: &ListQuery) -> AppResult<Vec<Record>> {
        Store::read_multiple(self, query).await
    }

    async fn count_elements(&self, filters: Option<&Record>) -> AppResult<i64> {
        Store::count_elements(self, filters).await
    }

    async fn link_owners(&self, id: EntityId) -> AppResult<Vec<LinkOwner>> {
        self.mapper().link_owners(id).await
    }
}
