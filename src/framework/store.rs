// Store - typed entry point to the record mapper for one entity type

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::AppResult;
use crate::framework::entity::{EntityAdapter, EntityDescriptor, EntityId, Record};
use crate::framework::mapper::{ListQuery, RecordMapper};

/// Generic store over a registered entity type `T`
pub struct Store<T: EntityAdapter> {
    mapper: Arc<RecordMapper>,
    descriptor: Arc<EntityDescriptor>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: EntityAdapter> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            mapper: Arc::clone(&self.mapper),
            descriptor: Arc::clone(&self.descriptor),
            _entity: PhantomData,
        }
    }
}

impl<T: EntityAdapter> std::fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("entity", &self.descriptor.name).finish()
    }
}

impl<T: EntityAdapter> Store<T> {
    /// Fails with a configuration error when `T` was never registered.
    pub fn new(mapper: Arc<RecordMapper>) -> AppResult<Self> {
        let descriptor = mapper.registry().descriptor(T::entity_name())?;
        Ok(Self {
            mapper,
            descriptor,
            _entity: PhantomData,
        })
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    pub fn mapper(&self) -> &Arc<RecordMapper> {
        &self.mapper
    }

    pub async fn create(&self, data: &Record) -> AppResult<Option<Record>> {
        self.mapper.create(&self.descriptor, data).await
    }

    pub async fn read(
        &self,
        id: EntityId,
        with_associations: bool,
        filters: Option<&Record>,
    ) -> AppResult<Option<Record>> {
        self.mapper.read(&self.descriptor, id, with_associations, filters).await
    }

    pub async fn update(&self, id: EntityId, data: &Record) -> AppResult<Option<Record>> {
        self.mapper.update(&self.descriptor, id, data).await
    }

    pub async fn delete(&self, id: EntityId) -> AppResult<bool> {
        self.mapper.delete(&self.descriptor, id).await
    }

    pub async fn read_multiple(&self, query: &ListQuery) -> AppResult<Vec<Record>> {
        self.mapper.read_multiple(&self.descriptor, query).await
    }

    pub async fn count_elements(&self, filters: Option<&Record>) -> AppResult<i64> {
        self.mapper.count_elements(&self.descriptor, filters).await
    }
}
