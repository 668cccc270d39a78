//! Core types and traits for savegraph.
//!
//! This crate provides the contract layer the save engine is written against:
//!
//! - `Value`, `Row` for column data
//! - `Node` for partially loaded input graphs
//! - `Catalog` for entity metadata
//! - `Connection` trait for the statement executor
//! - `Error` with the save error taxonomy, tagged by `SavePath`
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod identifiers;
pub mod meta;
pub mod node;
pub mod path;
pub mod row;
pub mod value;

pub use connection::Connection;
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, QueryError, QueryErrorKind, Result,
    SaveError, SaveErrorKind, StatementKind, TypeError,
};
pub use identifiers::{is_valid_identifier, quote_ident};
pub use meta::{
    AssociatedSaveMode, AssociationInfo, AssociationShape, BackReference, Catalog, CatalogBuilder,
    DissociateAction, EntityInfo, FieldInfo, ForeignKeyKind, LinkTableInfo,
};
pub use node::{Node, Slot};
pub use path::SavePath;
pub use row::Row;
pub use value::{RowKey, Value};
