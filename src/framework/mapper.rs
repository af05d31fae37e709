// Record Mapper - generic create/read/update/delete/list over any registered
// entity type. Works purely from `EntityDescriptor`s; there is no per-type
// persistence code anywhere in the crate.

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{Sqlite, SqliteConnection, SqliteRow};
use sqlx::{QueryBuilder, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{AppError, AppResult};
use crate::framework::entity::binding::platform_id_from_json;
use crate::framework::entity::{
    association_ids, coerce_scalar, Column, EdgeCardinality, EntityDescriptor, EntityDraft,
    EntityId, FieldRef, FieldStorage, Record, UnknownFieldPolicy, ID_FIELD,
};
use crate::framework::registry::EntityRegistry;
use crate::infrastructure::database::{current_time_millis, Database, SqlParam};

/// Nested association reads stop after this many levels.
pub const MAX_ASSOCIATION_DEPTH: u8 = 1;

const SELECT_COLUMNS: &str = "e.id, e.channel, e.platform_id, e.platform_created_at, e.data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    fn sql(self) -> &'static str {
        match self {
            SortDirection::Asc => " ASC",
            SortDirection::Desc => " DESC",
        }
    }
}

/// Paginated list request; `offset = limit * pagination`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListQuery {
    pub limit: i64,
    pub pagination: i64,
    pub ids: Option<Vec<EntityId>>,
    pub filters: Option<Record>,
    pub order_by: Option<String>,
    pub direction: SortDirection,
}

impl ListQuery {
    pub fn new(limit: i64, pagination: i64) -> Self {
        Self {
            limit,
            pagination,
            ids: None,
            filters: None,
            order_by: None,
            direction: SortDirection::Asc,
        }
    }

    pub fn with_ids(mut self, ids: Vec<EntityId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_filters(mut self, filters: Record) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn order_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.order_by = Some(field.to_string());
        self.direction = direction;
        self
    }

    /// Saturates instead of overflowing; a saturated offset selects nothing.
    pub fn offset(&self) -> i64 {
        self.limit.max(0).saturating_mul(self.pagination.max(0))
    }
}

/// One AND clause of a selection
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    IdIn(Vec<EntityId>),
    Column(Column, SqlParam),
    Data(String, SqlParam),
    /// Owner has `target` in the edge collection
    Linked { edge: String, target: EntityId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderKey {
    Id,
    Column(Column),
    ColumnLength(Column),
    Data(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub conditions: Vec<Condition>,
    pub order: Vec<(OrderKey, SortDirection)>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Selection {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self {
            conditions,
            ..Self::default()
        }
    }

    pub fn order(mut self, key: OrderKey, direction: SortDirection) -> Self {
        self.order.push((key, direction));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// An entity whose collections contain a given target, and so embed it on read
#[derive(Debug, Clone, PartialEq)]
pub struct LinkOwner {
    pub entity: String,
    pub id: EntityId,
    pub channel: Option<i64>,
    pub platform_id: Option<String>,
}

/// A raw `entities` row
#[derive(Debug, Clone)]
struct EntityRow {
    id: EntityId,
    channel: Option<i64>,
    platform_id: Option<String>,
    platform_created_at: Option<String>,
    data: Record,
}

impl EntityRow {
    fn from_row(row: &SqliteRow) -> AppResult<Self> {
        let raw: String = row.try_get("data")?;
        Ok(Self {
            id: row.try_get("id")?,
            channel: row.try_get("channel")?,
            platform_id: row.try_get("platform_id")?,
            platform_created_at: row.try_get("platform_created_at")?,
            data: parse_data(&raw)?,
        })
    }

    fn column_value(&self, column: Column) -> Value {
        match column {
            Column::Channel => self.channel.map(Value::from).unwrap_or(Value::Null),
            Column::PlatformId => self.platform_id.clone().map(Value::String).unwrap_or(Value::Null),
            Column::PlatformCreatedAt => self
                .platform_created_at
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        }
    }
}

fn parse_data(raw: &str) -> AppResult<Record> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Record::new()),
    }
}

/// Map a canonical JSON scalar onto a bindable parameter
fn json_param(field: &str, value: &Value) -> AppResult<SqlParam> {
    match value {
        Value::Null => Ok(SqlParam::Null),
        Value::String(s) => Ok(SqlParam::Text(s.clone())),
        Value::Bool(b) => Ok(SqlParam::Integer(*b as i64)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(SqlParam::Integer(i)),
            None => n
                .as_f64()
                .map(SqlParam::Real)
                .ok_or_else(|| AppError::Validation(format!("Filter '{}' has an unsupported number", field))),
        },
        Value::Array(_) | Value::Object(_) => Err(AppError::Validation(format!(
            "Filter '{}' must be a scalar value",
            field
        ))),
    }
}

fn json_path(field: &str) -> String {
    format!("$.{}", field)
}

/// Translate equality filters into selection conditions. Unknown keys are a
/// configuration error; values are coerced with the field's declared type.
pub fn translate_filters(descriptor: &EntityDescriptor, filters: &Record) -> AppResult<Vec<Condition>> {
    let mut conditions = Vec::with_capacity(filters.len());
    for (key, value) in filters {
        if key == ID_FIELD {
            conditions.push(Condition::IdIn(association_ids(ID_FIELD, value)?));
            continue;
        }

        match descriptor.field(key) {
            None => {
                return Err(AppError::ConfigurationError(format!(
                    "Entity {} has no field '{}' to filter on",
                    descriptor.name, key
                )))
            }
            Some(FieldRef::Scalar(definition)) => match definition.storage {
                FieldStorage::Data => {
                    let coerced = coerce_scalar(definition, value)?;
                    conditions.push(Condition::Data(key.clone(), json_param(key, &coerced)?));
                }
                FieldStorage::Column(Column::PlatformId) => {
                    let param = match value {
                        Value::Null => SqlParam::Null,
                        other => SqlParam::Text(platform_id_from_json(other)?),
                    };
                    conditions.push(Condition::Column(Column::PlatformId, param));
                }
                FieldStorage::Column(column) => {
                    let coerced = coerce_scalar(definition, value)?;
                    conditions.push(Condition::Column(column, json_param(key, &coerced)?));
                }
            },
            Some(FieldRef::Edge(edge)) => {
                for target in association_ids(&edge.name, value)? {
                    conditions.push(Condition::Linked {
                        edge: edge.name.clone(),
                        target,
                    });
                }
            }
        }
    }
    Ok(conditions)
}

/// Resolve a caller-supplied order field
pub fn order_key(descriptor: &EntityDescriptor, field: &str) -> AppResult<OrderKey> {
    if field == ID_FIELD {
        return Ok(OrderKey::Id);
    }
    match descriptor.field(field) {
        Some(FieldRef::Scalar(definition)) => Ok(match definition.storage {
            FieldStorage::Data => OrderKey::Data(definition.name.clone()),
            FieldStorage::Column(column) => OrderKey::Column(column),
        }),
        Some(FieldRef::Edge(_)) => Err(AppError::ConfigurationError(format!(
            "Cannot order {} by association '{}'",
            descriptor.name, field
        ))),
        None => Err(AppError::ConfigurationError(format!(
            "Entity {} has no field '{}' to order by",
            descriptor.name, field
        ))),
    }
}

fn push_conditions(qb: &mut QueryBuilder<'_, Sqlite>, conditions: &[Condition]) {
    for condition in conditions {
        qb.push(" AND ");
        match condition {
            Condition::IdIn(ids) if ids.is_empty() => {
                qb.push("0 = 1");
            }
            Condition::IdIn(ids) => {
                qb.push("e.id IN (");
                let mut separated = qb.separated(", ");
                for id in ids {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");
            }
            Condition::Column(column, SqlParam::Null) => {
                qb.push(format!("e.{} IS NULL", column.sql_name()));
            }
            Condition::Column(column, param) => {
                qb.push(format!("e.{} = ", column.sql_name()));
                param.clone().push_to(qb);
            }
            Condition::Data(field, SqlParam::Null) => {
                qb.push("json_extract(e.data, ");
                qb.push_bind(json_path(field));
                qb.push(") IS NULL");
            }
            Condition::Data(field, param) => {
                qb.push("json_extract(e.data, ");
                qb.push_bind(json_path(field));
                qb.push(") = ");
                param.clone().push_to(qb);
            }
            Condition::Linked { edge, target } => {
                qb.push("EXISTS (SELECT 1 FROM entity_links l WHERE l.owner_id = e.id AND l.field = ");
                qb.push_bind(edge.clone());
                qb.push(" AND l.target_id = ");
                qb.push_bind(*target);
                qb.push(")");
            }
        }
    }
}

fn push_order(qb: &mut QueryBuilder<'_, Sqlite>, order: &[(OrderKey, SortDirection)]) {
    qb.push(" ORDER BY ");
    for (key, direction) in order {
        match key {
            OrderKey::Id => {
                qb.push("e.id");
            }
            OrderKey::Column(column) => {
                qb.push(format!("e.{}", column.sql_name()));
            }
            OrderKey::ColumnLength(column) => {
                qb.push(format!("LENGTH(e.{})", column.sql_name()));
            }
            OrderKey::Data(field) => {
                qb.push("json_extract(e.data, ");
                qb.push_bind(json_path(field));
                qb.push(")");
            }
        }
        qb.push(direction.sql());
        qb.push(", ");
    }
    // Deterministic tie-break
    qb.push("e.id ASC");
}

/// Generic record mapper over the shared entity tables
pub struct RecordMapper {
    db: Arc<Database>,
    registry: Arc<EntityRegistry>,
    unknown_fields: UnknownFieldPolicy,
}

impl std::fmt::Debug for RecordMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordMapper")
            .field("entities", &self.registry.names())
            .field("unknown_fields", &self.unknown_fields)
            .finish()
    }
}

impl RecordMapper {
    pub fn new(db: Arc<Database>, registry: Arc<EntityRegistry>) -> Self {
        Self {
            db,
            registry,
            unknown_fields: UnknownFieldPolicy::Ignore,
        }
    }

    pub fn with_unknown_field_policy(mut self, policy: UnknownFieldPolicy) -> Self {
        self.unknown_fields = policy;
        self
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn bind(&self, descriptor: &EntityDescriptor, data: &Record) -> AppResult<EntityDraft> {
        EntityDraft::bind(descriptor, data, self.unknown_fields)
    }

    /// Bind `data` onto a new entity, persist it, and return it as read back.
    #[instrument(skip(self, descriptor, data), fields(entity = %descriptor.name))]
    pub async fn create(&self, descriptor: &EntityDescriptor, data: &Record) -> AppResult<Option<Record>> {
        let draft = self.bind(descriptor, data)?;

        let mut tx = self.db.pool().begin().await?;
        let id = insert_row(&mut *tx, descriptor, &draft).await?;
        self.append_links(&mut *tx, descriptor, id, &draft).await?;
        tx.commit().await?;

        debug!("Created {} {}", descriptor.name, id);
        self.read(descriptor, id, true, None).await
    }

    /// Load one entity. Associations are read one level deep at most.
    #[instrument(skip(self, descriptor, filters), fields(entity = %descriptor.name))]
    pub async fn read(
        &self,
        descriptor: &EntityDescriptor,
        id: EntityId,
        with_associations: bool,
        filters: Option<&Record>,
    ) -> AppResult<Option<Record>> {
        let mut conditions = vec![Condition::IdIn(vec![id])];
        if let Some(filters) = filters {
            conditions.extend(translate_filters(descriptor, filters)?);
        }
        let selection = Selection::new(conditions).limit(1);
        let mut records = self.select(descriptor, &selection, with_associations).await?;
        Ok(records.pop())
    }

    /// Bind `data` onto an existing entity. `None` when it does not exist.
    #[instrument(skip(self, descriptor, data), fields(entity = %descriptor.name))]
    pub async fn update(
        &self,
        descriptor: &EntityDescriptor,
        id: EntityId,
        data: &Record,
    ) -> AppResult<Option<Record>> {
        let draft = self.bind(descriptor, data)?;

        let mut tx = self.db.pool().begin().await?;
        if !update_row(&mut *tx, descriptor, id, &draft).await? {
            debug!("{} {} not found for update", descriptor.name, id);
            return Ok(None);
        }
        self.append_links(&mut *tx, descriptor, id, &draft).await?;
        tx.commit().await?;

        self.read(descriptor, id, true, None).await
    }

    /// Clear every collection of the entity, then remove it.
    #[instrument(skip(self, descriptor), fields(entity = %descriptor.name))]
    pub async fn delete(&self, descriptor: &EntityDescriptor, id: EntityId) -> AppResult<bool> {
        let mut tx = self.db.pool().begin().await?;
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM entities WHERE id = ? AND entity_type = ?")
            .bind(id)
            .bind(&descriptor.name)
            .fetch_optional(&mut *tx)
            .await?;
        if found.is_none() {
            return Ok(false);
        }

        for edge in descriptor.edges() {
            sqlx::query("DELETE FROM entity_links WHERE owner_id = ? AND field = ?")
                .bind(id)
                .bind(&edge.name)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::PersistenceError(format!(
                        "Failed to clear {}.{} for {}: {}",
                        descriptor.name, edge.name, id, e
                    ))
                })?;
        }

        sqlx::query("DELETE FROM entities WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::PersistenceError(format!("Failed to delete {} {}: {}", descriptor.name, id, e)))?;
        tx.commit().await?;

        debug!("Deleted {} {}", descriptor.name, id);
        Ok(true)
    }

    #[instrument(skip(self, descriptor, query), fields(entity = %descriptor.name))]
    pub async fn read_multiple(&self, descriptor: &EntityDescriptor, query: &ListQuery) -> AppResult<Vec<Record>> {
        let mut conditions = Vec::new();
        if let Some(ids) = &query.ids {
            conditions.push(Condition::IdIn(ids.clone()));
        }
        if let Some(filters) = &query.filters {
            conditions.extend(translate_filters(descriptor, filters)?);
        }

        let mut selection = Selection::new(conditions);
        if let Some(field) = &query.order_by {
            selection = selection.order(order_key(descriptor, field)?, query.direction);
        } else if query.direction == SortDirection::Desc {
            selection = selection.order(OrderKey::Id, SortDirection::Desc);
        }
        selection.limit = Some(query.limit.max(0));
        selection.offset = Some(query.offset());

        self.select(descriptor, &selection, true).await
    }

    #[instrument(skip(self, descriptor, filters), fields(entity = %descriptor.name))]
    pub async fn count_elements(&self, descriptor: &EntityDescriptor, filters: Option<&Record>) -> AppResult<i64> {
        let conditions = match filters {
            Some(filters) => translate_filters(descriptor, filters)?,
            None => Vec::new(),
        };
        self.count(descriptor, &conditions).await
    }

    /// Atomic insert-or-update keyed on `(platformId, channel)`. The unique
    /// index arbitrates concurrent writers, so there is no check-then-create
    /// window.
    #[instrument(skip(self, descriptor, data), fields(entity = %descriptor.name))]
    pub async fn upsert(&self, descriptor: &EntityDescriptor, data: &Record) -> AppResult<Option<Record>> {
        if !descriptor.channeled {
            return Err(AppError::ConfigurationError(format!(
                "Entity {} is not channeled and cannot be upserted",
                descriptor.name
            )));
        }
        let draft = self.bind(descriptor, data)?;
        let (Some(channel), Some(platform_id)) = (draft.channel, draft.platform_id.clone()) else {
            return Err(AppError::Validation(format!(
                "Upserting {} requires both channel and platformId",
                descriptor.name
            )));
        };

        let now = current_time_millis();
        let mut tx = self.db.pool().begin().await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO entities (entity_type, channel, platform_id, platform_created_at, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(entity_type, channel, platform_id) DO UPDATE SET updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&descriptor.name)
        .bind(channel.value())
        .bind(platform_id)
        .bind(draft.platform_created_at.as_ref().and_then(Value::as_str).map(str::to_string))
        .bind(serde_json::to_string(&draft.data)?)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::PersistenceError(format!("Failed to upsert {}: {}", descriptor.name, e)))?;

        update_row(&mut *tx, descriptor, id, &draft).await?;
        self.append_links(&mut *tx, descriptor, id, &draft).await?;
        tx.commit().await?;

        self.read(descriptor, id, true, None).await
    }

    /// Run a selection and materialize every matching row
    pub async fn select(
        &self,
        descriptor: &EntityDescriptor,
        selection: &Selection,
        with_associations: bool,
    ) -> AppResult<Vec<Record>> {
        let rows = self.fetch_rows(descriptor, selection).await?;
        let depth = if with_associations { MAX_ASSOCIATION_DEPTH } else { 0 };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(self.materialize(descriptor, row, depth).await?);
        }
        Ok(records)
    }

    pub async fn count(&self, descriptor: &EntityDescriptor, conditions: &[Condition]) -> AppResult<i64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM entities e WHERE e.entity_type = ");
        qb.push_bind(descriptor.name.clone());
        push_conditions(&mut qb, conditions);

        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| AppError::PersistenceError(format!("Failed to count {}: {}", descriptor.name, e)))?;
        Ok(count)
    }

    /// Every entity holding `target` in one of its collections
    pub async fn link_owners(&self, target: EntityId) -> AppResult<Vec<LinkOwner>> {
        let rows: Vec<(String, EntityId, Option<i64>, Option<String>)> = sqlx::query_as(
            "SELECT DISTINCT e.entity_type, e.id, e.channel, e.platform_id \
             FROM entity_links l JOIN entities e ON e.id = l.owner_id \
             WHERE l.target_id = ?",
        )
        .bind(target)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| AppError::PersistenceError(format!("Failed to load owners of {}: {}", target, e)))?;

        Ok(rows
            .into_iter()
            .map(|(entity, id, channel, platform_id)| LinkOwner {
                entity,
                id,
                channel,
                platform_id,
            })
            .collect())
    }

    async fn fetch_rows(&self, descriptor: &EntityDescriptor, selection: &Selection) -> AppResult<Vec<EntityRow>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM entities e WHERE e.entity_type = ",
            SELECT_COLUMNS
        ));
        qb.push_bind(descriptor.name.clone());
        push_conditions(&mut qb, &selection.conditions);
        push_order(&mut qb, &selection.order);

        match (selection.limit, selection.offset) {
            (Some(limit), offset) => {
                qb.push(" LIMIT ");
                qb.push_bind(limit);
                if let Some(offset) = offset {
                    qb.push(" OFFSET ");
                    qb.push_bind(offset);
                }
            }
            (None, Some(offset)) => {
                qb.push(" LIMIT -1 OFFSET ");
                qb.push_bind(offset);
            }
            (None, None) => {}
        }

        let rows = qb
            .build()
            .fetch_all(self.db.pool())
            .await
            .map_err(|e| AppError::PersistenceError(format!("Failed to load {}: {}", descriptor.name, e)))?;
        rows.iter().map(EntityRow::from_row).collect()
    }

    async fn linked_rows(&self, owner: EntityId, edge: &str) -> AppResult<Vec<EntityRow>> {
        let rows = sqlx::query(
            "SELECT e.id, e.channel, e.platform_id, e.platform_created_at, e.data \
             FROM entity_links l JOIN entities e ON e.id = l.target_id \
             WHERE l.owner_id = ? AND l.field = ? ORDER BY l.rowid",
        )
        .bind(owner)
        .bind(edge)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(EntityRow::from_row).collect()
    }

    /// Serialize a row. At `depth > 0` every edge is emitted as a collection:
    /// leaf targets inline their leaf value, other targets are materialized
    /// at `depth - 1`.
    fn materialize<'a>(
        &'a self,
        descriptor: &'a EntityDescriptor,
        row: EntityRow,
        depth: u8,
    ) -> BoxFuture<'a, AppResult<Record>> {
        async move {
            let mut record = Record::new();
            record.insert(ID_FIELD.to_string(), Value::from(row.id));

            for field in descriptor.fields() {
                let value = match field.storage {
                    FieldStorage::Data => row.data.get(&field.name).cloned().unwrap_or(Value::Null),
                    FieldStorage::Column(column) => row.column_value(column),
                };
                record.insert(field.name.clone(), value);
            }

            if depth == 0 {
                return Ok(record);
            }

            for edge in descriptor.edges() {
                let target = self.registry.descriptor(&edge.target_entity)?;
                let linked = self.linked_rows(row.id, &edge.name).await?;

                let mut items = Vec::with_capacity(linked.len());
                for linked_row in linked {
                    match &target.leaf_field {
                        Some(leaf) => items.push(linked_row.data.get(leaf).cloned().unwrap_or(Value::Null)),
                        None => items.push(Value::Object(
                            self.materialize(&target, linked_row, depth - 1).await?,
                        )),
                    }
                }
                record.insert(edge.name.clone(), Value::Array(items));
            }

            Ok(record)
        }
        .boxed()
    }

    /// Append draft links, enforcing target existence, `One` cardinality and
    /// the per-channel uniqueness of owner edges.
    async fn append_links(
        &self,
        conn: &mut SqliteConnection,
        descriptor: &EntityDescriptor,
        owner: EntityId,
        draft: &EntityDraft,
    ) -> AppResult<()> {
        for (edge_name, ids) in &draft.links {
            if ids.is_empty() {
                continue;
            }
            let edge = descriptor.edge(edge_name).ok_or_else(|| {
                AppError::ConfigurationError(format!("Entity {} has no edge '{}'", descriptor.name, edge_name))
            })?;

            let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, channel FROM entities WHERE entity_type = ");
            qb.push_bind(edge.target_entity.clone());
            qb.push(" AND id IN (");
            let mut separated = qb.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            let found: HashMap<EntityId, Option<i64>> = qb
                .build()
                .fetch_all(&mut *conn)
                .await?
                .iter()
                .map(|row| -> AppResult<(EntityId, Option<i64>)> {
                    Ok((row.try_get("id")?, row.try_get("channel")?))
                })
                .collect::<AppResult<_>>()?;

            if let Some(missing) = ids.iter().find(|id| !found.contains_key(*id)) {
                return Err(AppError::Validation(format!(
                    "Association '{}' references missing {} {}",
                    edge.name, edge.target_entity, missing
                )));
            }

            let mut members: Vec<(EntityId, Option<i64>)> = sqlx::query_as(
                "SELECT l.target_id, e.channel FROM entity_links l JOIN entities e ON e.id = l.target_id \
                 WHERE l.owner_id = ? AND l.field = ? ORDER BY l.rowid",
            )
            .bind(owner)
            .bind(&edge.name)
            .fetch_all(&mut *conn)
            .await?;
            for id in ids {
                if !members.iter().any(|(member, _)| member == id) {
                    members.push((*id, found.get(id).copied().flatten()));
                }
            }

            if edge.cardinality == EdgeCardinality::One && members.len() > 1 {
                return Err(AppError::Validation(format!(
                    "Association '{}' on {} holds at most one {}",
                    edge.name, descriptor.name, edge.target_entity
                )));
            }
            if edge.per_channel {
                let mut channels: Vec<i64> = members.iter().filter_map(|(_, channel)| *channel).collect();
                channels.sort_unstable();
                if channels.windows(2).any(|pair| pair[0] == pair[1]) {
                    return Err(AppError::Validation(format!(
                        "Association '{}' on {} already has a {} for that channel",
                        edge.name, descriptor.name, edge.target_entity
                    )));
                }
            }

            for id in ids {
                sqlx::query("INSERT OR IGNORE INTO entity_links (owner_id, field, target_id) VALUES (?, ?, ?)")
                    .bind(owner)
                    .bind(&edge.name)
                    .bind(*id)
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| AppError::PersistenceError(format!("Failed to link {}: {}", edge.name, e)))?;
            }
        }
        Ok(())
    }
}

async fn insert_row(conn: &mut SqliteConnection, descriptor: &EntityDescriptor, draft: &EntityDraft) -> AppResult<EntityId> {
    let now = current_time_millis();
    let result = sqlx::query(
        "INSERT INTO entities (entity_type, channel, platform_id, platform_created_at, data, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&descriptor.name)
    .bind(draft.channel.map(|c| c.value()))
    .bind(draft.platform_id.clone())
    .bind(draft.platform_created_at.as_ref().and_then(Value::as_str).map(str::to_string))
    .bind(serde_json::to_string(&draft.data)?)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::PersistenceError(format!("Failed to create {}: {}", descriptor.name, e)))?;
    Ok(result.last_insert_rowid())
}

/// Merge draft scalars into an existing row. `false` when the row is missing.
async fn update_row(
    conn: &mut SqliteConnection,
    descriptor: &EntityDescriptor,
    id: EntityId,
    draft: &EntityDraft,
) -> AppResult<bool> {
    let existing: Option<String> = sqlx::query_scalar("SELECT data FROM entities WHERE id = ? AND entity_type = ?")
        .bind(id)
        .bind(&descriptor.name)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(raw) = existing else {
        return Ok(false);
    };

    let mut data = parse_data(&raw)?;
    for (key, value) in &draft.data {
        data.insert(key.clone(), value.clone());
    }

    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE entities SET data = ");
    qb.push_bind(serde_json::to_string(&data)?);
    qb.push(", updated_at = ");
    qb.push_bind(current_time_millis());
    if let Some(channel) = draft.channel {
        qb.push(", channel = ");
        qb.push_bind(channel.value());
    }
    if let Some(platform_id) = &draft.platform_id {
        qb.push(", platform_id = ");
        qb.push_bind(platform_id.clone());
    }
    if let Some(created_at) = &draft.platform_created_at {
        qb.push(", platform_created_at = ");
        qb.push_bind(created_at.as_str().map(str::to_string));
    }
    qb.push(" WHERE id = ");
    qb.push_bind(id);

    qb.build()
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::PersistenceError(format!("Failed to update {} {}: {}", descriptor.name, id, e)))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::entity::{EdgeDefinition, FieldDefinition, FieldType};
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    async fn mapper() -> RecordMapper {
        let registry = EntityRegistry::builder()
            .register_descriptor(EntityDescriptor::new(
                "Shelf",
                false,
                None,
                vec![
                    FieldDefinition::new("label", FieldType::String),
                    FieldDefinition::new("rank", FieldType::Int),
                ],
                vec![
                    EdgeDefinition::to("books", "Book"),
                    EdgeDefinition::to("labels", "Label"),
                ],
            ))
            .register_descriptor(EntityDescriptor::new(
                "Book",
                false,
                None,
                vec![FieldDefinition::new("title", FieldType::String)],
                vec![EdgeDefinition::to("shelf", "Shelf").unique()],
            ))
            .register_descriptor(EntityDescriptor::new(
                "Label",
                false,
                Some("name"),
                vec![FieldDefinition::new("name", FieldType::String)],
                vec![],
            ))
            .build()
            .unwrap();
        let db = Database::new_in_memory().await.unwrap();
        RecordMapper::new(Arc::new(db), Arc::new(registry))
    }

    fn descriptor(mapper: &RecordMapper, name: &str) -> Arc<EntityDescriptor> {
        mapper.registry().descriptor(name).unwrap()
    }

    #[tokio::test]
    async fn test_nested_reads_stop_after_one_level() {
        let mapper = mapper().await;
        let shelf = descriptor(&mapper, "Shelf");
        let book = descriptor(&mapper, "Book");

        let s = mapper.create(&shelf, &record(json!({"label": "A"}))).await.unwrap().unwrap();
        let b = mapper
            .create(&book, &record(json!({"title": "Dune", "shelf": s["id"]})))
            .await
            .unwrap()
            .unwrap();
        let s = mapper
            .update(&shelf, s["id"].as_i64().unwrap(), &record(json!({"books": [b["id"]]})))
            .await
            .unwrap()
            .unwrap();

        let nested = &s["books"][0];
        assert_eq!(nested["title"], json!("Dune"));
        assert!(nested.get("shelf").is_none());
        assert_eq!(b["shelf"][0]["label"], json!("A"));

        let flat = mapper.read(&shelf, s["id"].as_i64().unwrap(), false, None).await.unwrap().unwrap();
        assert!(flat.get("books").is_none());
    }

    #[tokio::test]
    async fn test_leaf_targets_are_inlined() {
        let mapper = mapper().await;
        let shelf = descriptor(&mapper, "Shelf");
        let label = descriptor(&mapper, "Label");

        let red = mapper.create(&label, &record(json!({"name": "red"}))).await.unwrap().unwrap();
        let new = mapper.create(&label, &record(json!({"name": "new"}))).await.unwrap().unwrap();
        let s = mapper
            .create(&shelf, &record(json!({"labels": [red["id"], new["id"]]})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s["labels"], json!(["red", "new"]));
    }

    #[tokio::test]
    async fn test_one_cardinality_is_enforced() {
        let mapper = mapper().await;
        let shelf = descriptor(&mapper, "Shelf");
        let book = descriptor(&mapper, "Book");

        let a = mapper.create(&shelf, &record(json!({}))).await.unwrap().unwrap();
        let b = mapper.create(&shelf, &record(json!({}))).await.unwrap().unwrap();
        let created = mapper
            .create(&book, &record(json!({"shelf": a["id"]})))
            .await
            .unwrap()
            .unwrap();
        let id = created["id"].as_i64().unwrap();

        // Re-appending the same element is a no-op
        assert!(mapper.update(&book, id, &record(json!({"shelf": a["id"]}))).await.is_ok());
        let err = mapper.update(&book, id, &record(json!({"shelf": b["id"]}))).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_links_to_missing_targets_are_rejected() {
        let mapper = mapper().await;
        let book = descriptor(&mapper, "Book");
        let err = mapper.create(&book, &record(json!({"shelf": 404}))).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(msg) if msg.contains("missing Shelf 404")));
        assert_eq!(mapper.count_elements(&book, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_multiple_orders_filters_and_paginates() {
        let mapper = mapper().await;
        let shelf = descriptor(&mapper, "Shelf");
        for (label, rank) in [("a", 3), ("b", 1), ("c", 2), ("d", 1)] {
            mapper
                .create(&shelf, &record(json!({"label": label, "rank": rank})))
                .await
                .unwrap();
        }

        let page = mapper.read_multiple(&shelf, &ListQuery::new(2, 1)).await.unwrap();
        let labels: Vec<&Value> = page.iter().map(|r| &r["label"]).collect();
        assert_eq!(labels, vec![&json!("c"), &json!("d")]);

        let by_rank = mapper
            .read_multiple(&shelf, &ListQuery::new(10, 0).order_by("rank", SortDirection::Desc))
            .await
            .unwrap();
        assert_eq!(by_rank[0]["label"], json!("a"));

        let ones = ListQuery::new(10, 0).with_filters(record(json!({"rank": "1"})));
        assert_eq!(mapper.read_multiple(&shelf, &ones).await.unwrap().len(), 2);
        assert_eq!(mapper.count_elements(&shelf, ones.filters.as_ref()).await.unwrap(), 2);

        let first_id = page[0]["id"].as_i64().unwrap();
        let by_ids = ListQuery::new(10, 0).with_ids(vec![first_id]);
        assert_eq!(mapper.read_multiple(&shelf, &by_ids).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_huge_pages_saturate_instead_of_overflowing() {
        let query = ListQuery::new(i64::MAX / 2, 3);
        assert_eq!(query.offset(), i64::MAX);
        assert_eq!(ListQuery::new(-5, 2).offset(), 0);
        assert_eq!(ListQuery::new(10, 3).offset(), 30);

        let mapper = mapper().await;
        let shelf = descriptor(&mapper, "Shelf");
        mapper.create(&shelf, &record(json!({"label": "a"}))).await.unwrap();
        assert!(mapper.read_multiple(&shelf, &query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_link_owners_lists_every_embedding_entity() {
        let mapper = mapper().await;
        let shelf = descriptor(&mapper, "Shelf");
        let book = descriptor(&mapper, "Book");

        let b = mapper.create(&book, &record(json!({"title": "Emma"}))).await.unwrap().unwrap();
        let book_id = b["id"].as_i64().unwrap();
        assert!(mapper.link_owners(book_id).await.unwrap().is_empty());

        let s = mapper.create(&shelf, &record(json!({"books": book_id}))).await.unwrap().unwrap();
        let owners = mapper.link_owners(book_id).await.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].entity, "Shelf");
        assert_eq!(owners[0].id, s["id"].as_i64().unwrap());
        assert_eq!(owners[0].channel, None);
    }

    #[tokio::test]
    async fn test_unknown_filter_field_is_configuration_error() {
        let mapper = mapper().await;
        let shelf = descriptor(&mapper, "Shelf");
        let err = mapper
            .count_elements(&shelf, Some(&record(json!({"colour": "red"}))))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_delete_clears_links() {
        let mapper = mapper().await;
        let shelf = descriptor(&mapper, "Shelf");
        let book = descriptor(&mapper, "Book");

        let b = mapper.create(&book, &record(json!({"title": "Emma"}))).await.unwrap().unwrap();
        let s = mapper
            .create(&shelf, &record(json!({"books": b["id"]})))
            .await
            .unwrap()
            .unwrap();
        let shelf_id = s["id"].as_i64().unwrap();

        assert!(mapper.delete(&shelf, shelf_id).await.unwrap());
        assert!(!mapper.delete(&shelf, shelf_id).await.unwrap());

        let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entity_links")
            .fetch_one(mapper.database().pool())
            .await
            .unwrap();
        assert_eq!(links, 0);
        assert!(mapper.read(&book, b["id"].as_i64().unwrap(), true, None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_read_respects_entity_type_and_filters() {
        let mapper = mapper().await;
        let shelf = descriptor(&mapper, "Shelf");
        let book = descriptor(&mapper, "Book");

        let s = mapper.create(&shelf, &record(json!({"label": "x"}))).await.unwrap().unwrap();
        let id = s["id"].as_i64().unwrap();

        assert!(mapper.read(&book, id, true, None).await.unwrap().is_none());
        assert!(mapper
            .read(&shelf, id, true, Some(&record(json!({"label": "y"}))))
            .await
            .unwrap()
            .is_none());
        assert!(mapper.update(&book, id, &record(json!({}))).await.unwrap().is_none());
    }
}
