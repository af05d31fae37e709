use std::sync::Arc;

use crate::{
    commerce_interface::CommerceInterface,
    config::Config,
    framework::RecordMapper,
    infrastructure::{CacheKeyGenerator, CacheService, Database, InMemoryCacheBackend},
    schemas::{commerce_registry, commerce_repositories},
};

#[derive(Clone)]
pub struct AppState {
    pub commerce: CommerceInterface,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        // Initialize database
        let database = Database::connect(&config.database.url, config.database.max_connections).await?;
        database.initialize().await?;
        let database = Arc::new(database);

        let registry = Arc::new(commerce_registry()?);
        let mapper = Arc::new(
            RecordMapper::new(Arc::clone(&database), registry)
                .with_unknown_field_policy(config.mapper.unknown_fields),
        );
        let repositories = commerce_repositories(&mapper)?;

        // No entity can have more live list/count keys than the backend holds
        let cache = Arc::new(
            CacheService::new(
                Arc::new(InMemoryCacheBackend::new(config.cache.capacity)),
                CacheKeyGenerator::new(config.cache.key_prefix.clone()),
                config.cache.default_ttl(),
            )
            .with_tracked_limit(config.cache.capacity),
        );

        let commerce = CommerceInterface::new(database, repositories, cache, config.mapper.default_page_limit);

        Ok(Self { commerce, config })
    }
}
