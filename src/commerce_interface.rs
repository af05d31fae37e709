// Commerce Interface - HTTP access to the entity repositories
// Every route dispatches on the entity name to a cached repository.

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::{
    core::{channel_from_json, ChannelArg},
    error::{AppError, AppResult},
    framework::{EntityId, ListQuery, Record, Repository, SortDirection},
    infrastructure::{CacheService, CachedRepository, Database, EntityKeys},
    schemas::RepositoryMap,
};

/// Shared handle over the repositories, cache and database
#[derive(Clone)]
pub struct CommerceInterface {
    db: Arc<Database>,
    repositories: Arc<HashMap<String, Arc<dyn Repository>>>,
    cache: Arc<CacheService>,
    default_page_limit: i64,
}

impl CommerceInterface {
    /// Wraps every repository in a [`CachedRepository`].
    pub fn new(
        db: Arc<Database>,
        repositories: RepositoryMap,
        cache: Arc<CacheService>,
        default_page_limit: i64,
    ) -> Self {
        let repositories = repositories
            .into_iter()
            .map(|(name, repository)| {
                let cached: Arc<dyn Repository> =
                    Arc::new(CachedRepository::new(repository, Arc::clone(&cache), true));
                (name, cached)
            })
            .collect();
        Self {
            db,
            repositories: Arc::new(repositories),
            cache,
            default_page_limit,
        }
    }

    pub fn repository(&self, entity: &str) -> AppResult<Arc<dyn Repository>> {
        self.repositories
            .get(entity)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Unknown entity type '{}'", entity)))
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Split list parameters from equality filters
    fn list_query(&self, mut params: HashMap<String, String>) -> AppResult<ListQuery> {
        let limit = take_i64(&mut params, "limit")?.unwrap_or(self.default_page_limit);
        let page = take_i64(&mut params, "page")?.unwrap_or(0);
        let mut query = ListQuery::new(limit, page);

        let direction = match params.remove("direction").as_deref() {
            None => SortDirection::Asc,
            Some(d) if d.eq_ignore_ascii_case("asc") => SortDirection::Asc,
            Some(d) if d.eq_ignore_ascii_case("desc") => SortDirection::Desc,
            Some(other) => return Err(AppError::Validation(format!("Unknown sort direction '{}'", other))),
        };
        match params.remove("orderBy") {
            Some(field) => query = query.order_by(&field, direction),
            None => query.direction = direction,
        }

        if !params.is_empty() {
            query = query.with_filters(string_filters(params));
        }
        Ok(query)
    }
}

fn take_i64(params: &mut HashMap<String, String>, key: &str) -> AppResult<Option<i64>> {
    params
        .remove(key)
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|_| AppError::Validation(format!("Query parameter '{}' must be an integer", key)))
        })
        .transpose()
}

fn string_filters(params: HashMap<String, String>) -> Record {
    params.into_iter().map(|(k, v)| (k, Value::String(v))).collect()
}

fn object_body(body: Value) -> AppResult<Record> {
    match body {
        Value::Object(map) => Ok(map),
        other => Err(AppError::Validation(format!("Expected a JSON object body, got {}", other))),
    }
}

fn found(entity: &str, id: impl std::fmt::Display, record: Option<Record>) -> AppResult<Json<Value>> {
    record
        .map(|r| Json(Value::Object(r)))
        .ok_or_else(|| AppError::NotFound(format!("{} {} not found", entity, id)))
}

#[derive(Debug, Deserialize)]
pub struct ReadParams {
    #[serde(rename = "withAssociations")]
    pub with_associations: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct LastParams {
    /// `platformId` (default) or `platformCreatedAt`
    pub by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub entities: BTreeMap<String, EntityKeys>,
    pub channel: Option<Value>,
}

// HTTP Handlers

pub async fn create_entity_handler(
    State(api): State<CommerceInterface>,
    AxumPath(entity): AxumPath<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let repository = api.repository(&entity)?;
    let created = repository.create(&object_body(body)?).await?;
    let record = created
        .ok_or_else(|| AppError::PersistenceError(format!("Created {} could not be read back", entity)))?;
    Ok((StatusCode::CREATED, Json(Value::Object(record))))
}

pub async fn list_entities_handler(
    State(api): State<CommerceInterface>,
    AxumPath(entity): AxumPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, AppError> {
    let repository = api.repository(&entity)?;
    let query = api.list_query(params)?;
    let items = repository.read_multiple(&query).await?;
    Ok(Json(json!({
        "items": items,
        "limit": query.limit,
        "page": query.pagination,
    })))
}

pub async fn count_entities_handler(
    State(api): State<CommerceInterface>,
    AxumPath(entity): AxumPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, AppError> {
    let repository = api.repository(&entity)?;
    let filters = (!params.is_empty()).then(|| string_filters(params));
    let count = repository.count_elements(filters.as_ref()).await?;
    Ok(Json(json!({ "count": count })))
}

pub async fn get_entity_handler(
    State(api): State<CommerceInterface>,
    AxumPath((entity, id)): AxumPath<(String, EntityId)>,
    Query(params): Query<ReadParams>,
) -> Result<Json<Value>, AppError> {
    let repository = api.repository(&entity)?;
    let record = repository
        .read(id, params.with_associations.unwrap_or(true), None)
        .await?;
    found(&entity, id, record)
}

pub async fn update_entity_handler(
    State(api): State<CommerceInterface>,
    AxumPath((entity, id)): AxumPath<(String, EntityId)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let repository = api.repository(&entity)?;
    let record = repository.update(id, &object_body(body)?).await?;
    found(&entity, id, record)
}

pub async fn delete_entity_handler(
    State(api): State<CommerceInterface>,
    AxumPath((entity, id)): AxumPath<(String, EntityId)>,
) -> Result<Json<Value>, AppError> {
    let repository = api.repository(&entity)?;
    if repository.delete(id).await? {
        Ok(Json(json!({"id": id, "deleted": true})))
    } else {
        Err(AppError::NotFound(format!("{} {} not found", entity, id)))
    }
}

pub async fn upsert_entity_handler(
    State(api): State<CommerceInterface>,
    AxumPath(entity): AxumPath<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let repository = api.repository(&entity)?;
    let record = repository.upsert(&object_body(body)?).await?;
    record
        .map(|r| Json(Value::Object(r)))
        .ok_or_else(|| AppError::PersistenceError(format!("Upserted {} could not be read back", entity)))
}

pub async fn get_by_platform_id_handler(
    State(api): State<CommerceInterface>,
    AxumPath((entity, channel, platform_id)): AxumPath<(String, String, String)>,
) -> Result<Json<Value>, AppError> {
    let repository = api.repository(&entity)?;
    let record = repository
        .get_by_platform_id(&platform_id, ChannelArg::from(channel))
        .await?;
    found(&entity, &platform_id, record)
}

pub async fn get_last_handler(
    State(api): State<CommerceInterface>,
    AxumPath((entity, channel)): AxumPath<(String, String)>,
    Query(params): Query<LastParams>,
) -> Result<Json<Value>, AppError> {
    let repository = api.repository(&entity)?;
    let channel = ChannelArg::from(channel);
    let record = match params.by.as_deref() {
        None | Some("platformId") => repository.get_last_by_platform_id(channel).await?,
        Some("platformCreatedAt") => repository.get_last_by_platform_created_at(channel).await?,
        Some(other) => {
            return Err(AppError::Validation(format!(
                "Cannot order by '{}', expected platformId or platformCreatedAt",
                other
            )))
        }
    };
    found(&entity, "last", record)
}

pub async fn invalidate_cache_handler(
    State(api): State<CommerceInterface>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<Value>, AppError> {
    let channel = match &req.channel {
        None | Some(Value::Null) => None,
        Some(value) => Some(channel_from_json(value)?),
    };
    api.cache()
        .invalidate_multiple_entities(&req.entities, channel)
        .await;
    Ok(Json(json!({
        "invalidated": req.entities.keys().collect::<Vec<_>>(),
    })))
}

pub async fn health_handler(State(api): State<CommerceInterface>) -> Result<Json<Value>, AppError> {
    api.database().health_check().await?;
    Ok(Json(json!({
        "status": "ok",
        "cache": api.cache().metrics(),
    })))
}

pub fn create_commerce_router(api: CommerceInterface) -> Router {
    Router::new()
        // Generic entity operations
        .route("/entities/{entity}", post(create_entity_handler).get(list_entities_handler))
        .route("/entities/{entity}/count", get(count_entities_handler))
        .route("/entities/{entity}/upsert", put(upsert_entity_handler))
        .route(
            "/entities/{entity}/{id}",
            get(get_entity_handler)
                .patch(update_entity_handler)
                .delete(delete_entity_handler),
        )
        // Channel-scoped lookups
        .route(
            "/entities/{entity}/channels/{channel}/platform/{platform_id}",
            get(get_by_platform_id_handler),
        )
        .route("/entities/{entity}/channels/{channel}/last", get(get_last_handler))
        // Cache and health
        .route("/cache/invalidate", post(invalidate_cache_handler))
        .route("/health", get(health_handler))
        .with_state(api)
}
