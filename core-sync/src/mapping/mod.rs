//! Field mapping: declarative configuration, the record mapper and the
//! cross-table lookup builder.

pub mod config;
pub mod mapper;
pub mod tables;

pub use config::{ConfigError, EntityMapping, FieldMappingConfig, FieldSpec, Validation};
pub use mapper::{
    FieldMapper, MappedRecord, MappingError, MappingTable, MappingTables, MissingField,
    SchemaReport,
};
pub use tables::{MappingTableBuilder, MappingTableDefinition};
