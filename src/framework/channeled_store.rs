//! Channel-scoped repository.
//!
//! [`ChanneledStore`] decorates a [`Store`] for entity types that carry
//! `channel`, `platformId` and `platformCreatedAt`. It adds platform-id
//! lookups and atomic upserts, resolves channel arguments through
//! [`validate_channel`] before touching storage, and rewrites read results
//! so the top-level `channel` is its symbolic name.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::{channel_from_json, validate_channel, Channel, ChannelArg};
use crate::error::{AppError, AppResult};
use crate::framework::entity::{Column, EntityAdapter, EntityDescriptor, EntityId, Record, CHANNEL_FIELD};
use crate::framework::mapper::{
    translate_filters, Condition, LinkOwner, ListQuery, OrderKey, Selection, SortDirection,
};
use crate::framework::repository::Repository;
use crate::framework::store::Store;
use crate::infrastructure::database::SqlParam;

pub struct ChanneledStore<T: EntityAdapter> {
    inner: Store<T>,
}

impl<T: EntityAdapter> Clone for ChanneledStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: EntityAdapter> std::fmt::Debug for ChanneledStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChanneledStore")
            .field("entity", &self.inner.descriptor().name)
            .finish()
    }
}

fn channel_condition(channel: Channel) -> Condition {
    Condition::Column(Column::Channel, SqlParam::Integer(channel.value()))
}

/// Replace the `channel` filter value by its integer form, failing fast on
/// anything that is not a known channel.
fn resolve_channel_filter(filters: &Record) -> AppResult<Record> {
    let mut resolved = filters.clone();
    match filters.get(CHANNEL_FIELD) {
        None | Some(Value::Null) => {}
        Some(value) => {
            let channel = channel_from_json(value)?;
            resolved.insert(CHANNEL_FIELD.to_string(), Value::from(channel.value()));
        }
    }
    Ok(resolved)
}

/// Outgoing shape: symbolic top-level channel, nested association records
/// without their own channel.
pub fn translate_record(descriptor: &EntityDescriptor, mut record: Record) -> Record {
    if let Some(value) = record.get_mut(CHANNEL_FIELD) {
        if let Some(channel) = value.as_i64().and_then(Channel::from_value) {
            *value = Value::String(channel.name().to_string());
        }
    }
    for edge in descriptor.edges() {
        if let Some(Value::Array(items)) = record.get_mut(&edge.name) {
            for item in items.iter_mut() {
                if let Value::Object(nested) = item {
                    nested.remove(CHANNEL_FIELD);
                }
            }
        }
    }
    record
}

impl<T: EntityAdapter> ChanneledStore<T> {
    pub fn new(inner: Store<T>) -> AppResult<Self> {
        if !inner.descriptor().channeled {
            return Err(AppError::ConfigurationError(format!(
                "Entity {} is not channeled",
                inner.descriptor().name
            )));
        }
        Ok(Self { inner })
    }

    pub fn store(&self) -> &Store<T> {
        &self.inner
    }

    fn descriptor(&self) -> &EntityDescriptor {
        self.inner.descriptor()
    }

    fn translate(&self, record: Option<Record>) -> Option<Record> {
        record.map(|r| translate_record(self.descriptor(), r))
    }

    async fn first(&self, selection: Selection) -> AppResult<Option<Record>> {
        let mut records = self
            .inner
            .mapper()
            .select(self.descriptor(), &selection.limit(1), true)
            .await?;
        Ok(self.translate(records.pop()))
    }

    pub async fn create(&self, data: &Record) -> AppResult<Option<Record>> {
        Ok(self.translate(self.inner.create(data).await?))
    }

    pub async fn read(
        &self,
        id: EntityId,
        with_associations: bool,
        filters: Option<&Record>,
    ) -> AppResult<Option<Record>> {
        let filters = filters.map(resolve_channel_filter).transpose()?;
        let record = self.inner.read(id, with_associations, filters.as_ref()).await?;
        Ok(self.translate(record))
    }

    pub async fn update(&self, id: EntityId, data: &Record) -> AppResult<Option<Record>> {
        Ok(self.translate(self.inner.update(id, data).await?))
    }

    pub async fn delete(&self, id: EntityId) -> AppResult<bool> {
        self.inner.delete(id).await
    }

    pub async fn read_multiple(&self, query: &ListQuery) -> AppResult<Vec<Record>> {
        let mut query = query.clone();
        query.filters = query.filters.as_ref().map(resolve_channel_filter).transpose()?;
        let records = self.inner.read_multiple(&query).await?;
        Ok(records
            .into_iter()
            .map(|r| translate_record(self.descriptor(), r))
            .collect())
    }

    pub async fn count_elements(&self, filters: Option<&Record>) -> AppResult<i64> {
        let filters = filters.map(resolve_channel_filter).transpose()?;
        self.inner.count_elements(filters.as_ref()).await
    }

    #[instrument(skip(self, channel), fields(entity = %self.descriptor().name))]
    pub async fn exists_by_platform_id(&self, platform_id: &str, channel: impl Into<ChannelArg>) -> AppResult<bool> {
        let channel = validate_channel(channel)?;
        let conditions = [
            channel_condition(channel),
            Condition::Column(Column::PlatformId, SqlParam::Text(platform_id.to_string())),
        ];
        let count = self.inner.mapper().count(self.descriptor(), &conditions).await?;
        Ok(count > 0)
    }

    #[instrument(skip(self, channel), fields(entity = %self.descriptor().name))]
    pub async fn get_by_platform_id(
        &self,
        platform_id: &str,
        channel: impl Into<ChannelArg>,
    ) -> AppResult<Option<Record>> {
        let channel = validate_channel(channel)?;
        self.first(Selection::new(vec![
            channel_condition(channel),
            Condition::Column(Column::PlatformId, SqlParam::Text(platform_id.to_string())),
        ]))
        .await
    }

    /// Entity with the greatest platform id in the channel.
    ///
    /// Ids are compared by length first and then lexicographically, which
    /// matches numeric order only for non-negative decimal ids without
    /// leading zeros.
    #[instrument(skip(self, channel), fields(entity = %self.descriptor().name))]
    pub async fn get_last_by_platform_id(&self, channel: impl Into<ChannelArg>) -> AppResult<Option<Record>> {
        let channel = validate_channel(channel)?;
        self.first(
            Selection::new(vec![channel_condition(channel)])
                .order(OrderKey::ColumnLength(Column::PlatformId), SortDirection::Desc)
                .order(OrderKey::Column(Column::PlatformId), SortDirection::Desc),
        )
        .await
    }

    /// Most recently created on the platform; rows without a timestamp sort last.
    #[instrument(skip(self, channel), fields(entity = %self.descriptor().name))]
    pub async fn get_last_by_platform_created_at(
        &self,
        channel: impl Into<ChannelArg>,
    ) -> AppResult<Option<Record>> {
        let channel = validate_channel(channel)?;
        self.first(
            Selection::new(vec![channel_condition(channel)])
                .order(OrderKey::Column(Column::PlatformCreatedAt), SortDirection::Desc),
        )
        .await
    }

    /// First entity in the channel whose `field` equals `value`
    #[instrument(skip(self, value, channel), fields(entity = %self.descriptor().name))]
    pub async fn get_by_field(
        &self,
        field: &str,
        value: Value,
        channel: impl Into<ChannelArg>,
    ) -> AppResult<Option<Record>> {
        let channel = validate_channel(channel)?;
        let mut filter = Record::new();
        filter.insert(field.to_string(), value);

        let mut conditions = vec![channel_condition(channel)];
        conditions.extend(translate_filters(self.descriptor(), &filter)?);
        self.first(Selection::new(conditions)).await
    }

    pub async fn upsert(&self, data: &Record) -> AppResult<Option<Record>> {
        let record = self.inner.mapper().upsert(self.descriptor(), data).await?;
        debug!("Upserted {}", self.descriptor().name);
        Ok(self.translate(record))
    }
}

#[async_trait]
impl<T: EntityAdapter> Repository for ChanneledStore<T> {
    fn entity_name(&self) -> &str {
        &self.descriptor().name
    }

    fn is_channeled(&self) -> bool {
        true
    }

    async fn create(&self, data: &Record) -> AppResult<Option<Record>> {
        ChanneledStore::create(self, data).await
    }

    async fn read(
        &self,
        id: EntityId,
        with_associations: bool,
        filters: Option<&Record>,
    ) -> AppResult<Option<Record>> {
        ChanneledStore::read(self, id, with_associations, filters).await
    }

    async fn update(&self, id: EntityId, data: &Record) -> AppResult<Option<Record>> {
        ChanneledStore::update(self, id, data).await
    }

    async fn delete(&self, id: EntityId) -> AppResult<bool> {
        ChanneledStore::delete(self, id).await
    }

    async fn read_multiple(&self, query: &ListQuery) -> AppResult<Vec<Record>> {
        ChanneledStore::read_multiple(self, query).await
    }

    async fn count_elements(&self, filters: Option<&Record>) -> AppResult<i64> {
        ChanneledStore::count_elements(self, filters).await
    }

    async fn link_owners(&self, id: EntityId) -> AppResult<Vec<LinkOwner>> {
        self.inner.mapper().link_owners(id).await
    }

    async fn exists_by_platform_id(&self, platform_id: &str, channel: ChannelArg) -> AppResult<bool> {
        ChanneledStore::exists_by_platform_id(self, platform_id, channel).await
    }

    async fn get_by_platform_id(&self, platform_id: &str, channel: ChannelArg) -> AppResult<Option<Record>> {
        ChanneledStore::get_by_platform_id(self, platform_id, channel).await
    }

    async fn get_last_by_platform_id(&self, channel: ChannelArg) -> AppResult<Option<Record>> {
        ChanneledStore::get_last_by_platform_id(self, channel).await
    }

    async fn get_last_by_platform_created_at(&self, channel: ChannelArg) -> AppResult<Option<Record>> {
        ChanneledStore::get_last_by_platform_created_at(self, channel).await
    }

    async fn upsert(&self, data: &Record) -> AppResult<Option<Record>> {
        ChanneledStore::upsert(self, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_filter_is_resolved_or_rejected() {
        let filters = json!({"channel": "Shopify", "title": "x"}).as_object().cloned().unwrap();
        let resolved = resolve_channel_filter(&filters).unwrap();
        assert_eq!(resolved["channel"], json!(1));
        assert_eq!(resolved["title"], json!("x"));

        let bad = json!({"channel": 999}).as_object().cloned().unwrap();
        assert!(matches!(resolve_channel_filter(&bad), Err(AppError::InvalidChannel(_))));
        let bad = json!({"channel": ["shopify"]}).as_object().cloned().unwrap();
        assert!(matches!(resolve_channel_filter(&bad), Err(AppError::InvalidChannel(_))));
    }
}
