// Framework - entity model, registry, generic mapper and repositories

pub mod channeled_store;
pub mod entity;
pub mod mapper;
pub mod registry;
pub mod repository;
pub mod store;

pub use channeled_store::{translate_record, ChanneledStore};
pub use entity::{EntityAdapter, EntityDescriptor, EntityId, Record};
pub use mapper::{LinkOwner, ListQuery, RecordMapper, SortDirection};
pub use registry::EntityRegistry;
pub use repository::Repository;
pub use store::Store;
