//! Save command engine for savegraph.
//!
//! `savegraph-save` persists a partially loaded object graph by diffing it
//! against the rows already in the database. One [`SaveCommand`] walks the
//! graph from its root and, per sibling batch of nodes:
//!
//! - resolves identity by primary key or business key with one batched SELECT
//! - inserts or updates only what changed, under optimistic or pessimistic
//!   concurrency control
//! - reconciles each association by its save mode (`REPLACE`, `MERGE`,
//!   `APPEND`), dissociating children the graph no longer holds
//!
//! Statements are ordered so foreign keys are always satisfied and merged
//! into multi-row statements where their shape allows.
//!
//! # Example
//!
//! ```ignore
//! let store = Node::new("BookStore")
//!     .set("name", "MANNING")
//!     .set_many("books", vec![
//!         Node::new("Book").set("name", "SQL in Action").set("edition", 1),
//!     ]);
//!
//! let result = SaveCommand::new(&catalog, store)
//!     .options(SaveOptions::new().associated_mode(AssociatedSaveMode::Merge))
//!     .execute(&cx, &conn)
//!     .await;
//! ```
//!
//! The command never begins or commits a transaction; run it inside one.

/// Propagate anything but `Outcome::Ok` from an expression.
macro_rules! try_outcome {
    ($e:expr) => {
        match $e {
            asupersync::Outcome::Ok(v) => v,
            asupersync::Outcome::Err(e) => return asupersync::Outcome::Err(e),
            asupersync::Outcome::Cancelled(r) => return asupersync::Outcome::Cancelled(r),
            asupersync::Outcome::Panicked(p) => return asupersync::Outcome::Panicked(p),
        }
    };
}

/// Like `try_outcome!`, tagging executor errors as a failed SELECT on `table`.
macro_rules! try_select {
    ($e:expr, $path:expr, $table:expr) => {
        match $e {
            asupersync::Outcome::Ok(v) => v,
            asupersync::Outcome::Err(e) => {
                return asupersync::Outcome::Err(crate::plan::statement_failed(
                    $path,
                    $table,
                    savegraph_core::StatementKind::Select,
                    e,
                ));
            }
            asupersync::Outcome::Cancelled(r) => return asupersync::Outcome::Cancelled(r),
            asupersync::Outcome::Panicked(p) => return asupersync::Outcome::Panicked(p),
        }
    };
}

mod dissociate;
mod engine;
mod identity;
mod lock;
pub mod options;
pub mod plan;
mod reconcile;
pub mod result;
mod sql;
mod state;
#[cfg(test)]
mod testing;

pub use options::{IdCheckLevel, LockMode, SaveConfig, SaveMode, SaveOptions};
pub use plan::{FlushOrderer, FlushPlan, FlushResult, LinkTableOp, PendingOp};
pub use result::{AffectedRows, AffectedTable, BatchSaveResult, DeleteResult, SaveResult};
pub use state::NodeState;

use asupersync::{Cx, Outcome};
use engine::Saver;
use options::Settings;
use savegraph_core::{Catalog, Connection, EntityInfo, Error, Node, SaveError, SavePath, Value};

/// Look up the entity a command operates on.
fn command_entity<'c>(catalog: &'c Catalog, entity: &'static str) -> Result<&'c EntityInfo, Error> {
    catalog.entity(entity).ok_or_else(|| {
        Error::Save(SaveError::InvalidNode {
            path: SavePath::root(entity),
            entity,
            message: "entity is not declared in the catalog".to_string(),
        })
    })
}

/// Save one aggregate root and everything loaded below it.
#[derive(Debug)]
pub struct SaveCommand<'c> {
    catalog: &'c Catalog,
    node: Node,
    config: SaveConfig,
    options: SaveOptions,
}

impl<'c> SaveCommand<'c> {
    /// Create a command saving `node` with default config and options.
    pub fn new(catalog: &'c Catalog, node: Node) -> Self {
        Self {
            catalog,
            node,
            config: SaveConfig::default(),
            options: SaveOptions::default(),
        }
    }

    /// Save several roots of one entity type in one command.
    pub fn all(catalog: &'c Catalog, nodes: Vec<Node>) -> BatchSaveCommand<'c> {
        BatchSaveCommand {
            catalog,
            nodes,
            config: SaveConfig::default(),
            options: SaveOptions::default(),
        }
    }

    /// Set the environment-wide defaults (builder pattern).
    #[must_use]
    pub fn config(mut self, config: SaveConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the per-command options (builder pattern).
    #[must_use]
    pub fn options(mut self, options: SaveOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the command.
    ///
    /// The input node is left as it was; the result carries an echo copy
    /// with assigned ids and versions. Any failure leaves the database in
    /// whatever state the statements issued so far produced, so the caller's
    /// transaction should be rolled back.
    #[tracing::instrument(level = "info", skip(self, cx, conn), fields(entity = self.node.entity()))]
    pub async fn execute<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<SaveResult, Error> {
        let settings = Settings::new(&self.config, &self.options);
        if let Err(e) = settings.validate(self.catalog) {
            return Outcome::Err(e);
        }
        let entity = match command_entity(self.catalog, self.node.entity()) {
            Ok(entity) => entity,
            Err(e) => return Outcome::Err(e),
        };

        let mut modified = self.node.clone();
        let mut saver = Saver::new(cx, conn, self.catalog, settings);
        try_outcome!(saver.save_roots(entity, vec![&mut modified]).await);
        let affected = saver.into_affected();

        tracing::info!(
            entity = entity.name,
            tables = affected.iter().count(),
            rows = affected.total(),
            "Save command completed"
        );
        Outcome::Ok(SaveResult {
            original: self.node.clone(),
            modified,
            affected,
        })
    }
}

/// Save several roots of one entity type.
///
/// The roots form a single sibling batch, so their identities are resolved
/// and their rows written together.
#[derive(Debug)]
pub struct BatchSaveCommand<'c> {
    catalog: &'c Catalog,
    nodes: Vec<Node>,
    config: SaveConfig,
    options: SaveOptions,
}

impl<'c> BatchSaveCommand<'c> {
    /// Set the environment-wide defaults (builder pattern).
    #[must_use]
    pub fn config(mut self, config: SaveConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the per-command options (builder pattern).
    #[must_use]
    pub fn options(mut self, options: SaveOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the command.
    #[tracing::instrument(level = "info", skip(self, cx, conn), fields(count = self.nodes.len()))]
    pub async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
    ) -> Outcome<BatchSaveResult, Error> {
        let settings = Settings::new(&self.config, &self.options);
        if let Err(e) = settings.validate(self.catalog) {
            return Outcome::Err(e);
        }
        let Some(first) = self.nodes.first() else {
            return Outcome::Ok(BatchSaveResult {
                original: Vec::new(),
                modified: Vec::new(),
                affected: AffectedRows::new(),
            });
        };
        let entity = match command_entity(self.catalog, first.entity()) {
            Ok(entity) => entity,
            Err(e) => return Outcome::Err(e),
        };
        if let Some(other) = self.nodes.iter().find(|n| n.entity() != entity.name) {
            return Outcome::Err(Error::Save(SaveError::InvalidNode {
                path: SavePath::root(entity.name),
                entity: entity.name,
                message: format!("batch mixes {} and {} roots", entity.name, other.entity()),
            }));
        }

        let mut modified = self.nodes.clone();
        let mut saver = Saver::new(cx, conn, self.catalog, settings);
        try_outcome!(saver.save_roots(entity, modified.iter_mut().collect()).await);
        let affected = saver.into_affected();

        tracing::info!(
            entity = entity.name,
            roots = modified.len(),
            rows = affected.total(),
            "Batch save command completed"
        );
        Outcome::Ok(BatchSaveResult {
            original: self.nodes.clone(),
            modified,
            affected,
        })
    }
}

/// Delete rows of one entity by primary key.
///
/// Rows referencing the deleted ones are handled by the dissociate action
/// of their foreign key, and join-table rows are removed.
#[derive(Debug)]
pub struct DeleteCommand<'c> {
    catalog: &'c Catalog,
    entity: &'static str,
    ids: Vec<Value>,
    config: SaveConfig,
    options: SaveOptions,
}

impl<'c> DeleteCommand<'c> {
    /// Create a command deleting `ids` of `entity`.
    pub fn new(catalog: &'c Catalog, entity: &'static str, ids: Vec<Value>) -> Self {
        Self {
            catalog,
            entity,
            ids,
            config: SaveConfig::default(),
            options: SaveOptions::default(),
        }
    }

    /// Set the environment-wide defaults (builder pattern).
    #[must_use]
    pub fn config(mut self, config: SaveConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the per-command options (builder pattern).
    #[must_use]
    pub fn options(mut self, options: SaveOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the command.
    #[tracing::instrument(level = "info", skip(self, cx, conn), fields(entity = self.entity, count = self.ids.len()))]
    pub async fn execute<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<DeleteResult, Error> {
        let settings = Settings::new(&self.config, &self.options);
        if let Err(e) = settings.validate(self.catalog) {
            return Outcome::Err(e);
        }
        let entity = match command_entity(self.catalog, self.entity) {
            Ok(entity) => entity,
            Err(e) => return Outcome::Err(e),
        };
        let ids: Vec<Value> = self.ids.iter().filter(|id| !id.is_null()).cloned().collect();
        if ids.is_empty() {
            return Outcome::Ok(DeleteResult::default());
        }

        let mut saver = Saver::new(cx, conn, self.catalog, settings);
        try_outcome!(
            saver
                .delete_rows(entity, ids, &SavePath::root(entity.name))
                .await
        );
        let affected = saver.into_affected();

        tracing::info!(
            entity = entity.name,
            rows = affected.total(),
            "Delete command completed"
        );
        Outcome::Ok(DeleteResult { affected })
    }
}
