// Field binding - turns loosely-typed input into a typed draft
// Scalars overwrite, edges append. Nothing here touches storage.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};
use tracing::debug;

use crate::core::channel::{channel_from_json, Channel};
use crate::error::{AppError, AppResult};
use crate::framework::entity::schema::{
    Column, EntityDescriptor, EntityId, FieldDefinition, FieldRef, FieldStorage, FieldType,
    Record, UnknownFieldPolicy, ID_FIELD,
};

/// Pending mutation for one entity, produced by binding input fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityDraft {
    /// Values destined for the JSON document
    pub data: Record,
    pub channel: Option<Channel>,
    pub platform_id: Option<String>,
    /// `Some(Value::Null)` clears the column
    pub platform_created_at: Option<Value>,
    /// Edge name to appended target ids, in input order
    pub links: Vec<(String, Vec<EntityId>)>,
}

impl EntityDraft {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every key of `input`. Keys the descriptor does not know are
    /// skipped or rejected according to `policy`; `id` is always skipped.
    pub fn bind(
        descriptor: &EntityDescriptor,
        input: &Record,
        policy: UnknownFieldPolicy,
    ) -> AppResult<Self> {
        let mut draft = Self::new();
        for (key, value) in input {
            if key == ID_FIELD {
                continue;
            }
            if !draft.apply(descriptor, key, value)? {
                match policy {
                    UnknownFieldPolicy::Ignore => {
                        debug!("Ignoring unknown field '{}' on {}", key, descriptor.name)
                    }
                    UnknownFieldPolicy::Reject => {
                        return Err(AppError::ConfigurationError(format!(
                            "Entity {} has no field '{}'",
                            descriptor.name, key
                        )))
                    }
                }
            }
        }
        Ok(draft)
    }

    /// Apply one field. Returns `Ok(false)` when the descriptor has no such field.
    pub fn apply(&mut self, descriptor: &EntityDescriptor, field: &str, value: &Value) -> AppResult<bool> {
        match descriptor.field(field) {
            None => Ok(false),
            Some(FieldRef::Scalar(definition)) => {
                self.set_scalar(definition, value)?;
                Ok(true)
            }
            Some(FieldRef::Edge(edge)) => {
                let ids = association_ids(&edge.name, value)?;
                self.append_links(&edge.name, ids);
                Ok(true)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
            && self.channel.is_none()
            && self.platform_id.is_none()
            && self.platform_created_at.is_none()
            && self.links.is_empty()
    }

    fn set_scalar(&mut self, definition: &FieldDefinition, value: &Value) -> AppResult<()> {
        match definition.storage {
            FieldStorage::Data => {
                let coerced = coerce_scalar(definition, value)?;
                self.data.insert(definition.name.clone(), coerced);
            }
            // Identity columns cannot be cleared; null leaves them as they are
            FieldStorage::Column(Column::Channel | Column::PlatformId) if value.is_null() => {}
            FieldStorage::Column(Column::Channel) => {
                self.channel = Some(channel_from_json(value)?);
            }
            FieldStorage::Column(Column::PlatformId) => {
                self.platform_id = Some(platform_id_from_json(value)?);
            }
            FieldStorage::Column(Column::PlatformCreatedAt) => {
                self.platform_created_at = Some(coerce_scalar(definition, value)?);
            }
        }
        Ok(())
    }

    fn append_links(&mut self, edge: &str, ids: Vec<EntityId>) {
        let index = match self.links.iter().position(|(name, _)| name == edge) {
            Some(index) => index,
            None => {
                self.links.push((edge.to_string(), Vec::new()));
                self.links.len() - 1
            }
        };
        let targets = &mut self.links[index].1;
        for id in ids {
            if !targets.contains(&id) {
                targets.push(id);
            }
        }
    }
}

/// Coerce a loosely-typed value into the canonical JSON form of `definition`.
/// Null is accepted for every type.
pub fn coerce_scalar(definition: &FieldDefinition, value: &Value) -> AppResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let invalid = || {
        AppError::Validation(format!(
            "Field '{}' expects {:?}, got {}",
            definition.name, definition.field_type, value
        ))
    };

    match definition.field_type {
        FieldType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(invalid()),
        },
        FieldType::Int => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => n
                .as_i64()
                .map(Value::from)
                .ok_or_else(invalid),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| invalid()),
            _ => Err(invalid()),
        },
        FieldType::Float => {
            let parsed = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            parsed
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(invalid)
        }
        FieldType::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(invalid()),
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        },
        FieldType::Time => match value {
            Value::String(s) => parse_timestamp(s).map(Value::String).ok_or_else(invalid),
            _ => Err(invalid()),
        },
        FieldType::JSON => Ok(value.clone()),
        FieldType::Channel => channel_from_json(value).map(|c| Value::from(c.value())),
    }
}

/// Normalize a timestamp to RFC 3339 UTC with second precision so that
/// string ordering in storage matches chronological ordering.
pub fn parse_timestamp(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })?;
    Some(parsed.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Platform ids are opaque strings; numbers are accepted and stringified.
pub fn platform_id_from_json(value: &Value) -> AppResult<String> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(AppError::Validation(format!(
            "platformId must be a non-empty string or number, got {}",
            other
        ))),
    }
}

/// Edge values: an id, an object carrying `id`, or an array of either.
pub fn association_ids(edge: &str, value: &Value) -> AppResult<Vec<EntityId>> {
    fn single(edge: &str, value: &Value) -> AppResult<EntityId> {
        let id = match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            Value::Object(map) => map.get(ID_FIELD).and_then(Value::as_i64),
            _ => None,
        };
        id.ok_or_else(|| {
            AppError::Validation(format!(
                "Association '{}' expects an entity id, got {}",
                edge, value
            ))
        })
    }

    match value {
        Value::Array(items) => items.iter().map(|item| single(edge, item)).collect(),
        Value::Null => Err(AppError::Validation(format!(
            "Association '{}' cannot be cleared by binding",
            edge
        ))),
        other => Ok(vec![single(edge, other)?]),
    }
}
