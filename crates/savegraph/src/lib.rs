//! savegraph - persist nested object graphs by diffing them against rows.
//!
//! A caller hands over a partially loaded graph of entity nodes (a book
//! store with some of its books, each book with some authors) and the
//! engine works out which rows to insert, which columns to update, and what
//! happens to rows the graph no longer references.
//!
//! - `savegraph-core`: values, rows, errors, the entity [`Catalog`], the
//!   input [`Node`] and the [`Connection`] executor trait
//! - `savegraph-save`: the [`SaveCommand`] and [`DeleteCommand`] engine
//!
//! # Quick Start
//!
//! ```ignore
//! use savegraph::prelude::*;
//!
//! let catalog = Catalog::builder()
//!     .entity(
//!         EntityInfo::new("BookStore", "book_store")
//!             .field(FieldInfo::new("id", "id").primary_key(true).generated(true))
//!             .field(FieldInfo::new("name", "name").key(true))
//!             .association(AssociationInfo::one_to_many("books", "Book", "store")),
//!     )
//!     .entity(
//!         EntityInfo::new("Book", "book")
//!             .field(FieldInfo::new("id", "id").primary_key(true).generated(true))
//!             .field(FieldInfo::new("name", "name").key(true))
//!             .field(FieldInfo::new("edition", "edition").key(true))
//!             .association(
//!                 AssociationInfo::many_to_one("store", "BookStore", "store_id")
//!                     .nullable(true)
//!                     .on_dissociate(DissociateAction::SetNull),
//!             ),
//!     )
//!     .build()?;
//!
//! async fn save_store(cx: &Cx, conn: &impl Connection, catalog: &Catalog) {
//!     let store = Node::new("BookStore")
//!         .set("name", "MANNING")
//!         .set_many("books", vec![
//!             Node::new("Book").set("name", "SQL in Action").set("edition", 1),
//!         ]);
//!
//!     match SaveCommand::new(catalog, store).execute(cx, conn).await {
//!         Outcome::Ok(result) => println!("{} rows", result.total_affected()),
//!         Outcome::Err(e) => eprintln!("save failed: {e}"),
//!         Outcome::Cancelled(_) | Outcome::Panicked(_) => {}
//!     }
//! }
//! ```

// Re-export all public types from sub-crates
pub use savegraph_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    AssociatedSaveMode,
    AssociationInfo,
    AssociationShape,
    Catalog,
    CatalogBuilder,
    Connection,
    DissociateAction,
    EntityInfo,
    Error,
    FieldInfo,
    ForeignKeyKind,
    LinkTableInfo,
    Node,
    Result,
    Row,
    RowKey,
    SaveError,
    SaveErrorKind,
    SavePath,
    Slot,
    StatementKind,
    Value,
};

pub use savegraph_save::{
    AffectedRows, AffectedTable, BatchSaveCommand, BatchSaveResult, DeleteCommand, DeleteResult,
    IdCheckLevel, LockMode, NodeState, SaveCommand, SaveConfig, SaveMode, SaveOptions, SaveResult,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use savegraph::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AssociatedSaveMode, AssociationInfo, Catalog, Connection, Cx, DeleteCommand,
        DissociateAction, EntityInfo, Error, FieldInfo, IdCheckLevel, LinkTableInfo, LockMode,
        Node, Outcome, Result, Row, SaveCommand, SaveConfig, SaveErrorKind, SaveMode,
        SaveOptions, Value,
    };
}
