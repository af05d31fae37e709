// Cache Decorator - cache-aside reads and write invalidation around any repository

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::core::{channel_from_json, validate_channel, Channel, ChannelArg};
use crate::error::AppResult;
use crate::framework::entity::{EntityId, Record, CHANNEL_FIELD, ID_FIELD, PLATFORM_ID_FIELD};
use crate::framework::mapper::{LinkOwner, ListQuery};
use crate::framework::repository::Repository;
use crate::infrastructure::cache_layer::{CacheId, CacheService, EntityKeys};

/// Channel named by a filter set, if any
fn filter_channel(filters: Option<&Record>) -> AppResult<Option<Channel>> {
    match filters.and_then(|f| f.get(CHANNEL_FIELD)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => channel_from_json(value).map(Some),
    }
}

pub struct CachedRepository {
    inner: Arc<dyn Repository>,
    cache: Arc<CacheService>,
    enable_caching: bool,
}

impl std::fmt::Debug for CachedRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedRepository")
            .field("entity", &self.inner.entity_name())
            .field("enable_caching", &self.enable_caching)
            .finish()
    }
}

impl CachedRepository {
    pub fn new(inner: Arc<dyn Repository>, cache: Arc<CacheService>, enable_caching: bool) -> Self {
        Self {
            inner,
            cache,
            enable_caching,
        }
    }

    /// Platform lookup key of a record that carries channel and platformId
    fn platform_key(&self, record: &Record) -> Option<String> {
        let channel = record.get(CHANNEL_FIELD).and_then(|v| channel_from_json(v).ok())?;
        let platform_id = record.get(PLATFORM_ID_FIELD).and_then(Value::as_str)?;
        Some(
            self.cache
                .keys()
                .for_channeled_entity(channel, self.inner.entity_name(), platform_id),
        )
    }

    /// Entities embedding `id`. A failed lookup is logged; the write it
    /// follows has already been committed.
    async fn owners_of(&self, id: Option<EntityId>) -> Vec<LinkOwner> {
        let Some(id) = id else {
            return Vec::new();
        };
        match self.inner.link_owners(id).await {
            Ok(owners) => owners,
            Err(e) => {
                warn!("Could not load owners of {} {}: {}", self.inner.entity_name(), id, e);
                Vec::new()
            }
        }
    }

    /// Drop the entity key of `id`, the platform keys of every given state
    /// of the record, the entity's list/count keys, and the same keys of
    /// every owner that embeds the record.
    async fn invalidate_written(&self, id: Option<EntityId>, states: &[Option<&Record>], owners: &[LinkOwner]) {
        let mut ids: BTreeMap<String, Vec<CacheId>> = BTreeMap::new();
        ids.entry(self.inner.entity_name().to_string())
            .or_default()
            .extend(id.map(CacheId::from));
        for owner in owners {
            ids.entry(owner.entity.clone()).or_default().push(CacheId::from(owner.id));
        }
        let entities: BTreeMap<String, EntityKeys> =
            ids.into_iter().map(|(name, ids)| (name, EntityKeys::Many(ids))).collect();
        self.cache.invalidate_multiple_entities(&entities, None).await;

        let mut platform_keys: Vec<String> = states
            .iter()
            .flatten()
            .filter_map(|record| self.platform_key(record))
            .collect();
        for owner in owners {
            let channel = owner.channel.and_then(Channel::from_value);
            if let (Some(channel), Some(platform_id)) = (channel, &owner.platform_id) {
                platform_keys.push(
                    self.cache
                        .keys()
                        .for_channeled_entity(channel, &owner.entity, platform_id),
                );
            }
        }
        self.cache.invalidate_keys(&platform_keys).await;
    }
}

fn record_id(record: &Record) -> Option<EntityId> {
    record.get(ID_FIELD).and_then(Value::as_i64)
}

#[async_trait]
impl Repository for CachedRepository {
    fn entity_name(&self) -> &str {
        self.inner.entity_name()
    }

    fn is_channeled(&self) -> bool {
        self.inner.is_channeled()
    }

    async fn create(&self, data: &Record) -> AppResult<Option<Record>> {
        let created = self.inner.create(data).await?;
        if self.enable_caching {
            let id = created.as_ref().and_then(record_id);
            self.invalidate_written(id, &[created.as_ref()], &[]).await;
        }
        Ok(created)
    }

    #[instrument(skip(self, filters), fields(entity = %self.inner.entity_name()))]
    async fn read(
        &self,
        id: EntityId,
        with_associations: bool,
        filters: Option<&Record>,
    ) -> AppResult<Option<Record>> {
        if !self.enable_caching || !with_associations || filters.is_some() {
            return self.inner.read(id, with_associations, filters).await;
        }

        let key = self.cache.keys().for_entity(self.inner.entity_name(), id);
        let inner = &self.inner;
        self.cache
            .get(&key, move || inner.read(id, true, None), None)
            .await
    }

    async fn update(&self, id: EntityId, data: &Record) -> AppResult<Option<Record>> {
        if !self.enable_caching {
            return self.inner.update(id, data).await;
        }

        // Platform keys of the previous state go stale too
        let before = self.inner.read(id, false, None).await?;
        let updated = self.inner.update(id, data).await?;
        if updated.is_some() {
            let owners = self.owners_of(Some(id)).await;
            self.invalidate_written(Some(id), &[before.as_ref(), updated.as_ref()], &owners)
                .await;
        }
        Ok(updated)
    }

    async fn delete(&self, id: EntityId) -> AppResult<bool> {
        if !self.enable_caching {
            return self.inner.delete(id).await;
        }

        let before = self.inner.read(id, false, None).await?;
        // Links to the record cascade away with it
        let owners = self.owners_of(Some(id)).await;
        let deleted = self.inner.delete(id).await?;
        if deleted {
            self.invalidate_written(Some(id), &[before.as_ref()], &owners).await;
        }
        Ok(deleted)
    }

    #[instrument(skip(self, query), fields(entity = %self.inner.entity_name()))]
    async fn read_multiple(&self, query: &ListQuery) -> AppResult<Vec<Record>> {
        if !self.enable_caching {
            return self.inner.read_multiple(query).await;
        }

        let channel = filter_channel(query.filters.as_ref())?;
        let name = self.inner.entity_name();
        let key = self.cache.keys().for_list(name, channel, &serde_json::to_value(query)?);
        let inner = &self.inner;
        self.cache
            .get_tracked(name, &key, move || inner.read_multiple(query), None)
            .await
    }

    #[instrument(skip(self, filters), fields(entity = %self.inner.entity_name()))]
    async fn count_elements(&self, filters: Option<&Record>) -> AppResult<i64> {
        if !self.enable_caching {
            return self.inner.count_elements(filters).await;
        }

        let channel = filter_channel(filters)?;
        let name = self.inner.entity_name();
        let scope = Value::Object(filters.cloned().unwrap_or_default());
        let key = self.cache.keys().for_count(name, channel, &scope);
        let inner = &self.inner;
        self.cache
            .get_tracked(name, &key, move || inner.count_elements(filters), None)
            .await
    }

    async fn link_owners(&self, id: EntityId) -> AppResult<Vec<LinkOwner>> {
        self.inner.link_owners(id).await
    }

    async fn exists_by_platform_id(&self, platform_id: &str, channel: ChannelArg) -> AppResult<bool> {
        self.inner.exists_by_platform_id(platform_id, channel).await
    }

    #[instrument(skip(self, channel), fields(entity = %self.inner.entity_name()))]
    async fn get_by_platform_id(&self, platform_id: &str, channel: ChannelArg) -> AppResult<Option<Record>> {
        if !self.enable_caching || !self.inner.is_channeled() {
            return self.inner.get_by_platform_id(platform_id, channel).await;
        }

        let channel = validate_channel(channel)?;
        let key = self
            .cache
            .keys()
            .for_channeled_entity(channel, self.inner.entity_name(), platform_id);
        let inner = &self.inner;
        self.cache
            .get(&key, move || inner.get_by_platform_id(platform_id, channel.into()), None)
            .await
    }

    async fn get_last_by_platform_id(&self, channel: ChannelArg) -> AppResult<Option<Record>> {
        self.inner.get_last_by_platform_id(channel).await
    }

    async fn get_last_by_platform_created_at(&self, channel: ChannelArg) -> AppResult<Option<Record>> {
        self.inner.get_last_by_platform_created_at(channel).await
    }

    async fn upsert(&self, data: &Record) -> AppResult<Option<Record>> {
        let upserted = self.inner.upsert(data).await?;
        if self.enable_caching {
            let id = upserted.as_ref().and_then(record_id);
            debug!("Invalidating upserted {} {:?}", self.inner.entity_name(), id);
            let owners = self.owners_of(id).await;
            self.invalidate_written(id, &[upserted.as_ref()], &owners).await;
        }
        Ok(upserted)
    }
}
