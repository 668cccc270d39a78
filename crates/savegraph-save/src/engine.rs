//! The recursive graph walk.
//!
//! [`Saver::save_batch`] reconciles one sibling batch of nodes of a single
//! entity type:
//!
//! 1. validate node shapes and identities (no SQL yet)
//! 2. save many-to-one targets, whose ids become this batch's FK values
//! 3. resolve identities with one batched SELECT per lookup kind
//! 4. queue INSERTs and UPDATEs of changed columns, then flush them
//! 5. copy generated ids and new versions into the echo nodes
//! 6. reconcile inverse and join-table associations, recursing per child batch
//!
//! Nodes are the caller's echo copy; the input graph is never touched.

use crate::identity::{Existing, IdentityResolver, Lookup};
use crate::lock::ConcurrencyGuard;
use crate::options::{LockMode, SaveMode, Settings};
use crate::plan::{FlushOrderer, FlushPlan, FlushResult, LinkTableOp, PendingOp};
use crate::result::AffectedRows;
use crate::state::{BatchStates, NodeState};
use asupersync::{Cx, Outcome};
use savegraph_core::{
    AssociatedSaveMode, AssociationShape, Catalog, Connection, EntityInfo, Error, Node, Row,
    SaveError, SaveErrorKind, SavePath, Slot, Value,
};
use std::future::Future;
use std::pin::Pin;

/// Boxed future used by the recursive walk.
pub(crate) type SaveFuture<'f, T> = Pin<Box<dyn Future<Output = Outcome<T, Error>> + 'f>>;

/// How rows of one sibling batch are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RowMode {
    /// Update matches, insert the rest.
    Upsert,
    /// Insert without reading.
    InsertOnly,
    /// Update without inserting; identities by id are not read.
    UpdateOnly,
    /// Insert without reading and without the business key requirement.
    Append,
    /// Id-only references: read by id, touch only the parent's FK column.
    /// Unmatched ids fail when `strict`, and are dropped otherwise.
    Reference { strict: bool },
}

impl RowMode {
    pub(crate) fn root(mode: SaveMode) -> Self {
        match mode {
            SaveMode::Upsert => RowMode::Upsert,
            SaveMode::InsertOnly => RowMode::InsertOnly,
            SaveMode::UpdateOnly => RowMode::UpdateOnly,
        }
    }

    /// Mode for long (non-reference) children of an association.
    pub(crate) fn children(mode: AssociatedSaveMode) -> Self {
        match mode {
            AssociatedSaveMode::Append => RowMode::Append,
            AssociatedSaveMode::Merge | AssociatedSaveMode::Replace => RowMode::Upsert,
        }
    }

    fn reads(self, lookup: &Lookup) -> bool {
        match (self, lookup) {
            (RowMode::InsertOnly | RowMode::Append, _) | (_, Lookup::Absent) => false,
            (RowMode::UpdateOnly, Lookup::Id(_)) => false,
            _ => true,
        }
    }

    fn decide(self, lookup: &Lookup, found: bool) -> Decision {
        match self {
            RowMode::Upsert if found => Decision::Update,
            RowMode::Upsert | RowMode::InsertOnly | RowMode::Append => Decision::Insert,
            RowMode::UpdateOnly => match lookup {
                Lookup::Id(_) => Decision::Update,
                _ if found => Decision::Update,
                _ => Decision::Skip,
            },
            RowMode::Reference { .. } if found => Decision::Update,
            RowMode::Reference { strict: true } => Decision::Missing,
            RowMode::Reference { strict: false } => Decision::Skip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Insert,
    Update,
    Skip,
    Missing,
}

/// One node of a sibling batch.
#[derive(Debug)]
pub(crate) struct Candidate<'n> {
    pub(crate) node: &'n mut Node,
    /// FK column and value pointing at the parent, for inverse children.
    pub(crate) parent_fk: Option<(&'static str, Value)>,
}

impl<'n> Candidate<'n> {
    pub(crate) fn new(node: &'n mut Node) -> Self {
        Self {
            node,
            parent_fk: None,
        }
    }

    pub(crate) fn child(node: &'n mut Node, column: &'static str, parent_id: Value) -> Self {
        Self {
            node,
            parent_fk: Some((column, parent_id)),
        }
    }
}

/// State of one save or delete command.
pub(crate) struct Saver<'a, C> {
    pub(crate) cx: &'a Cx,
    pub(crate) conn: &'a C,
    pub(crate) catalog: &'a Catalog,
    pub(crate) settings: Settings<'a>,
    pub(crate) guard: ConcurrencyGuard,
    orderer: FlushOrderer,
    affected: AffectedRows,
}

fn push_unique(columns: &mut Vec<&'static str>, column: &'static str) {
    if !columns.contains(&column) {
        columns.push(column);
    }
}

/// Check a node against its entity before anything is written.
pub(crate) fn validate_node(
    entity: &EntityInfo,
    node: &Node,
    path: &SavePath,
) -> Result<(), SaveError> {
    let invalid = |message: String| SaveError::InvalidNode {
        path: path.clone(),
        entity: entity.name,
        message,
    };
    if node.entity() != entity.name {
        return Err(invalid(format!(
            "expected a {} node, found {}",
            entity.name,
            node.entity()
        )));
    }
    for (prop, slot) in node.slots() {
        if entity.find_field(prop).is_some() {
            if !matches!(slot, Slot::Scalar(_)) {
                return Err(invalid(format!("column property '{prop}' takes a scalar")));
            }
            continue;
        }
        let Some(association) = entity.find_association(prop) else {
            return Err(invalid(format!("unknown property '{prop}'")));
        };
        match (association.list, slot) {
            (true, Slot::Many(_)) | (false, Slot::One(_)) => {}
            (true, _) => return Err(invalid(format!("association '{prop}' takes a list"))),
            (false, _) => {
                return Err(invalid(format!(
                    "association '{prop}' takes a single node or null"
                )));
            }
        }
    }
    Ok(())
}

/// Whether a node can be written under `mode` without further identity.
fn check_identity(
    entity: &EntityInfo,
    key_props: &[&'static str],
    lookup: &Lookup,
    mode: RowMode,
    path: &SavePath,
) -> Result<(), SaveError> {
    if !matches!(lookup, Lookup::Absent) {
        return Ok(());
    }
    let insertable = entity.id().generated;
    let ok = match mode {
        RowMode::Append => insertable,
        RowMode::Upsert | RowMode::InsertOnly => key_props.is_empty() && insertable,
        RowMode::UpdateOnly | RowMode::Reference { .. } => false,
    };
    if ok {
        Ok(())
    } else {
        Err(SaveError::MissingIdentity {
            path: path.clone(),
            entity: entity.name,
            key_props: key_props.to_vec(),
        })
    }
}

impl<'a, C: Connection> Saver<'a, C> {
    pub(crate) fn new(cx: &'a Cx, conn: &'a C, catalog: &'a Catalog, settings: Settings<'a>) -> Self {
        Self {
            cx,
            conn,
            catalog,
            settings,
            guard: ConcurrencyGuard::new(settings.lock_mode(), settings.nowait()),
            orderer: FlushOrderer::from_catalog(catalog),
            affected: AffectedRows::new(),
        }
    }

    pub(crate) fn into_affected(self) -> AffectedRows {
        self.affected
    }

    /// Order and run queued operations, accumulating affected rows.
    pub(crate) async fn flush(
        &mut self,
        ops: Vec<PendingOp>,
        links: Vec<LinkTableOp>,
        path: &SavePath,
    ) -> Outcome<FlushResult, Error> {
        let plan: FlushPlan = self.orderer.order(ops, links);
        let result = try_outcome!(
            plan.execute(self.cx, self.conn, path, self.settings.max_batch_rows())
                .await
        );
        self.affected.merge(&result.affected);
        Outcome::Ok(result)
    }

    /// Save the aggregate roots of one command.
    pub(crate) async fn save_roots(
        &mut self,
        entity: &'a EntityInfo,
        roots: Vec<&mut Node>,
    ) -> Outcome<Vec<NodeState>, Error> {
        let mode = RowMode::root(self.settings.save_mode());
        let batch = roots.into_iter().map(Candidate::new).collect();
        self.save_batch(entity, batch, mode, SavePath::root(entity.name))
            .await
    }

    /// Reconcile one sibling batch and everything below it.
    ///
    /// Returns the final state of every candidate, indexed like `batch`.
    pub(crate) fn save_batch<'f>(
        &'f mut self,
        entity: &'a EntityInfo,
        mut batch: Vec<Candidate<'f>>,
        mode: RowMode,
        path: SavePath,
    ) -> SaveFuture<'f, Vec<NodeState>> {
        Box::pin(async move {
            let mut states = BatchStates::new(entity.name, batch.len());
            if batch.is_empty() {
                return Outcome::Ok(states.into_vec());
            }
            tracing::debug!(
                entity = entity.name,
                count = batch.len(),
                mode = ?mode,
                path = %path,
                "Saving batch"
            );

            // 1. Shapes and identities
            let key_props = self.settings.key_props(entity);
            let mut lookups = Vec::with_capacity(batch.len());
            for (index, candidate) in batch.iter().enumerate() {
                if let Err(e) = validate_node(entity, candidate.node, &path) {
                    return Outcome::Err(e.into());
                }
                let lookup = Lookup::of(candidate.node, entity, &key_props);
                if let Err(e) = check_identity(entity, &key_props, &lookup, mode, &path) {
                    states.advance(index, NodeState::IdentityFailed);
                    return Outcome::Err(e.into());
                }
                lookups.push(lookup);
            }
            states.advance_all(NodeState::Unresolved, NodeState::Resolving);

            // 2. Many-to-one targets
            try_outcome!(self.save_foreign_key_targets(entity, &mut batch, mode, &path).await);

            // 3. Existence checks
            let reads: Vec<Lookup> = lookups
                .iter()
                .filter(|lookup| mode.reads(lookup))
                .cloned()
                .collect();
            let existing = if reads.is_empty() {
                Existing::default()
            } else {
                let columns = self.written_columns(entity, &batch, mode);
                let resolver = IdentityResolver::new(
                    entity,
                    &key_props,
                    self.guard,
                    self.settings.max_batch_rows(),
                );
                try_outcome!(
                    resolver
                        .resolve(self.cx, self.conn, &reads, &columns, &path)
                        .await
                )
            };

            // 4. Row operations
            let mut ops = Vec::new();
            let mut checks = Vec::new();
            let mut missing = Vec::new();
            for (index, candidate) in batch.iter_mut().enumerate() {
                let row = existing.get(&lookups[index]);
                match mode.decide(&lookups[index], row.is_some()) {
                    Decision::Insert => {
                        states.advance(index, NodeState::Inserting);
                        ops.push(self.insert_op(entity, index, candidate));
                    }
                    Decision::Update => {
                        states.advance(index, NodeState::Updating);
                        if let (Lookup::Key(_), Some(row)) = (&lookups[index], row) {
                            let id = entity.id();
                            let value = row.get_by_name(id.column_name).cloned().unwrap_or(Value::Null);
                            candidate.node.assign(id.name, value);
                        }
                        match self.update_op(entity, index, candidate, row, mode, &path) {
                            Ok(Some((op, check))) => {
                                ops.push(op);
                                checks.push(check);
                            }
                            Ok(None) => {}
                            Err(e) => {
                                states.advance(index, NodeState::LockFailed);
                                return Outcome::Err(e.into());
                            }
                        }
                    }
                    Decision::Skip => {
                        if let RowMode::Reference { .. } = mode {
                            tracing::warn!(
                                entity = entity.name,
                                id = %candidate.node.non_null(entity.id().name).cloned().unwrap_or(savegraph_core::Value::Null),
                                path = %path,
                                "Dropping reference to missing row"
                            );
                        }
                        states.advance(index, NodeState::Skipped);
                    }
                    Decision::Missing => {
                        if let Some(id) = candidate.node.non_null(entity.id().name) {
                            missing.push(id.clone());
                        }
                    }
                }
            }
            if !missing.is_empty() {
                return Outcome::Err(Error::Save(SaveError::IllegalReferenceId {
                    association: path.associations().last().copied().unwrap_or(entity.name),
                    path,
                    target: entity.name,
                    ids: missing,
                }));
            }

            // 5. Flush and echo
            let result = try_outcome!(self.flush(ops, Vec::new(), &path).await);
            for (index, value) in result.generated {
                batch[index].node.assign(entity.id().name, value);
            }
            for (index, affected) in result.updated {
                let Some(check) = checks.iter().find(|c| c.index == index) else {
                    continue;
                };
                if let Err(e) = ConcurrencyGuard::verify_update(
                    entity,
                    &check.id,
                    check.expected_version.as_ref(),
                    affected,
                    &path,
                ) {
                    states.advance(index, NodeState::LockFailed);
                    return Outcome::Err(e.into());
                }
            }
            let inserted: Vec<bool> = (0..batch.len())
                .map(|i| states.get(i) == NodeState::Inserting)
                .collect();
            states.advance_all(NodeState::Inserting, NodeState::AssociationsPending);
            states.advance_all(NodeState::Updating, NodeState::AssociationsPending);

            // 6. Associations owned elsewhere
            for association in &entity.associations {
                let outcome = match &association.shape {
                    AssociationShape::ForeignKey { .. } => continue,
                    AssociationShape::Inverse { .. } => {
                        self.reconcile_inverse(entity, association, &mut batch, &states, &inserted, &path)
                            .await
                    }
                    AssociationShape::JoinTable(_) => {
                        self.reconcile_join_table(
                            entity,
                            association,
                            &mut batch,
                            &states,
                            &inserted,
                            &path,
                        )
                        .await
                    }
                };
                match outcome {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => {
                        if e.save_error_kind() == Some(SaveErrorKind::DissociationNotAllowed) {
                            states.advance_all(
                                NodeState::AssociationsPending,
                                NodeState::DissociationBlocked,
                            );
                        }
                        return Outcome::Err(e);
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }

            states.advance_all(NodeState::AssociationsPending, NodeState::Reconciled);
            Outcome::Ok(states.into_vec())
        })
    }

    /// Columns the identity SELECT fetches beyond the keys, for diffing.
    fn written_columns(
        &self,
        entity: &EntityInfo,
        batch: &[Candidate<'_>],
        mode: RowMode,
    ) -> Vec<&'static str> {
        let mut columns = Vec::new();
        if !matches!(mode, RowMode::Reference { .. }) {
            for field in &entity.fields {
                if !field.primary_key
                    && !field.version
                    && batch.iter().any(|c| c.node.is_loaded(field.name))
                {
                    push_unique(&mut columns, field.column_name);
                }
            }
            for association in &entity.associations {
                if let Some(column) = association.foreign_key_column() {
                    if batch.iter().any(|c| c.node.is_loaded(association.name)) {
                        push_unique(&mut columns, column);
                    }
                }
            }
        }
        for candidate in batch {
            if let Some((column, _)) = &candidate.parent_fk {
                push_unique(&mut columns, column);
            }
        }
        columns
    }

    /// FK column values this node writes, in association order.
    ///
    /// The parent's FK wins over a loaded association on the same column.
    fn foreign_key_values(&self, entity: &EntityInfo, candidate: &Candidate<'_>) -> Vec<(&'static str, Value)> {
        let mut values: Vec<(&'static str, Value)> = Vec::new();
        for association in &entity.associations {
            let Some(column) = association.foreign_key_column() else {
                continue;
            };
            if let Some((parent_column, parent_id)) = &candidate.parent_fk {
                if *parent_column == column {
                    values.push((column, parent_id.clone()));
                    continue;
                }
            }
            let value = match candidate.node.get(association.name) {
                Some(Slot::One(Some(target))) => self
                    .catalog
                    .entity(association.target)
                    .and_then(|t| target.non_null(t.id().name))
                    .cloned()
                    .unwrap_or(Value::Null),
                Some(Slot::One(None)) => Value::Null,
                _ => continue,
            };
            values.push((column, value));
        }
        if let Some((column, parent_id)) = &candidate.parent_fk {
            if !values.iter().any(|(c, _)| c == column) {
                values.push((column, parent_id.clone()));
            }
        }
        values
    }

    fn insert_op(&self, entity: &EntityInfo, index: usize, candidate: &mut Candidate<'_>) -> PendingOp {
        let id = entity.id();
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for field in &entity.fields {
            if field.version {
                continue;
            }
            match candidate.node.scalar(field.name) {
                Some(value) if field.primary_key && value.is_null() => {}
                Some(value) => {
                    columns.push(field.column_name);
                    values.push(value.clone());
                }
                None => {}
            }
        }
        if let Some(version) = entity.version() {
            let value = ConcurrencyGuard::insert_version(candidate.node.scalar(version.name));
            candidate.node.assign(version.name, value.clone());
            columns.push(version.column_name);
            values.push(value);
        }
        for (column, value) in self.foreign_key_values(entity, candidate) {
            if !columns.contains(&column) {
                columns.push(column);
                values.push(value);
            }
        }
        let returning = candidate
            .node
            .non_null(id.name)
            .is_none()
            .then_some(id.column_name);
        PendingOp::Insert {
            index,
            table: entity.table,
            columns,
            values,
            returning,
        }
    }

    /// UPDATE for a matched node, or `None` when nothing would change.
    ///
    /// `row` is the existing row when it was read; without it every loaded
    /// column is written.
    #[allow(clippy::result_large_err)]
    fn update_op(
        &self,
        entity: &EntityInfo,
        index: usize,
        candidate: &mut Candidate<'_>,
        row: Option<&Row>,
        mode: RowMode,
        path: &SavePath,
    ) -> Result<Option<(PendingOp, UpdateCheck)>, SaveError> {
        let id = entity.id();
        let Some(pk) = candidate.node.non_null(id.name).cloned() else {
            return Ok(None);
        };
        let differs = |column: &str, value: &Value| {
            row.and_then(|r| r.get_by_name(column))
                .is_none_or(|current| !current.same_as(value))
        };

        let mut set_columns = Vec::new();
        let mut set_values = Vec::new();
        for field in &entity.fields {
            if field.primary_key || field.version {
                continue;
            }
            if let Some(value) = candidate.node.scalar(field.name) {
                if differs(field.column_name, value) {
                    set_columns.push(field.column_name);
                    set_values.push(value.clone());
                }
            }
        }
        for (column, value) in self.foreign_key_values(entity, candidate) {
            if differs(column, &value) && !set_columns.contains(&column) {
                set_columns.push(column);
                set_values.push(value);
            }
        }

        let version_field = entity.version();
        let reference = matches!(mode, RowMode::Reference { .. }) || candidate.node.is_reference(id.name);
        let supplied = version_field
            .and_then(|f| candidate.node.scalar(f.name))
            .filter(|v| !v.is_null())
            .cloned();
        let current = version_field
            .and_then(|f| row.and_then(|r| r.get_by_name(f.column_name)))
            .filter(|v| !v.is_null())
            .cloned();
        let stale = self.guard.mode() == LockMode::Optimistic
            && matches!((&supplied, &current), (Some(s), Some(c)) if !s.same_as(c));

        if set_columns.is_empty() && !stale {
            return Ok(None);
        }

        let expected_version = if reference {
            None
        } else {
            self.guard
                .version_predicate(entity, &pk, supplied.as_ref(), path)?
        };
        if let Some(field) = version_field {
            let base = expected_version.clone().or(current).or(supplied);
            if let Some(next) = base.and_then(|v| v.next_version()) {
                candidate.node.assign(field.name, next);
            }
        }

        let op = PendingOp::Update {
            index,
            table: entity.table,
            pk_column: id.column_name,
            pk_value: pk.clone(),
            set_columns,
            set_values,
            bump_version: version_field.map(|f| f.column_name),
            expected_version: expected_version.clone(),
        };
        Ok(Some((
            op,
            UpdateCheck {
                index,
                id: pk,
                expected_version,
            },
        )))
    }
}

/// What an UPDATE's affected-row count is checked against.
#[derive(Debug)]
struct UpdateCheck {
    index: usize,
    id: Value,
    expected_version: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{SaveConfig, SaveOptions};
    use crate::testing::{MockConnection, err, ok, row};
    use savegraph_core::{AssociationInfo, FieldInfo};

    fn catalog() -> Catalog {
        Catalog::builder()
            .entity(
                EntityInfo::new("BookStore", "book_store")
                    .field(FieldInfo::new("id", "id").primary_key(true).generated(true))
                    .field(FieldInfo::new("name", "name").key(true)),
            )
            .entity(
                EntityInfo::new("Book", "book")
                    .field(FieldInfo::new("id", "id").primary_key(true).generated(true))
                    .field(FieldInfo::new("name", "name").key(true))
                    .field(FieldInfo::new("edition", "edition").key(true))
                    .field(FieldInfo::new("price", "price"))
                    .field(FieldInfo::new("version", "version").version(true))
                    .association(
                        AssociationInfo::many_to_one("store", "BookStore", "store_id")
                            .nullable(true),
                    ),
            )
            .build()
            .unwrap()
    }

    fn save(
        catalog: &Catalog,
        conn: &MockConnection,
        options: &SaveOptions,
        node: &mut Node,
    ) -> Outcome<(Vec<NodeState>, AffectedRows), Error> {
        let config = SaveConfig::default();
        let entity = catalog.entity(node.entity()).unwrap();
        crate::testing::run(async move {
            let cx = Cx::for_testing();
            let mut saver = Saver::new(&cx, conn, catalog, Settings::new(&config, options));
            let states = try_outcome!(saver.save_roots(entity, vec![node]).await);
            Outcome::Ok((states, saver.into_affected()))
        })
    }

    #[test]
    fn test_row_mode_reads() {
        let id = Lookup::Id(savegraph_core::RowKey::single(Value::BigInt(1)));
        assert!(RowMode::Upsert.reads(&id));
        assert!(!RowMode::UpdateOnly.reads(&id));
        assert!(!RowMode::Append.reads(&id));
        assert!(!RowMode::InsertOnly.reads(&id));
        assert!(RowMode::Reference { strict: false }.reads(&id));
        assert!(!RowMode::Upsert.reads(&Lookup::Absent));
    }

    #[test]
    fn test_validate_node_shapes() {
        let catalog = catalog();
        let book = catalog.entity("Book").unwrap();
        let path = SavePath::root("Book");

        assert!(validate_node(book, &Node::new("Book").set("name", "x"), &path).is_ok());
        let err = validate_node(book, &Node::new("Book").set("title", "x"), &path).unwrap_err();
        assert_eq!(err.kind(), SaveErrorKind::InvalidNode);
        let err = validate_node(book, &Node::new("Book").set_many("store", vec![]), &path).unwrap_err();
        assert!(err.to_string().contains("single node"));
        let err = validate_node(book, &Node::new("BookStore"), &path).unwrap_err();
        assert!(err.to_string().contains("expected a Book node"));
    }

    #[test]
    fn test_insert_assigns_generated_id_and_version() {
        let catalog = catalog();
        let conn = MockConnection::new();
        let log = conn.log();
        let mut node = Node::new("Book")
            .set("name", "SQL in Action")
            .set("edition", 1)
            .set_one("store", Some(Node::reference("BookStore", "id", 2i64)));
        let (states, affected) =
            ok(save(&catalog, &conn, &SaveOptions::new(), &mut node));
        assert_eq!(states, vec![NodeState::Reconciled]);
        assert_eq!(affected.table("book"), 1);
        assert_eq!(node.scalar("id"), Some(&Value::BigInt(1001)));
        assert_eq!(node.scalar("version"), Some(&Value::BigInt(0)));

        let statements = log.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].0.starts_with("SELECT"));
        assert_eq!(
            statements[1].0,
            "INSERT INTO \"book\" (\"name\", \"edition\", \"version\", \"store_id\") VALUES ($1, $2, $3, $4) RETURNING \"id\""
        );
        assert_eq!(statements[1].1[3], Value::BigInt(2));
    }

    #[test]
    fn test_unchanged_row_is_not_updated() {
        let catalog = catalog();
        let conn = MockConnection::new().on_query("FROM \"book\"", |_| {
            vec![row(&[
                ("id", Value::BigInt(10)),
                ("name", Value::from("GraphQL in Action")),
                ("edition", Value::Int(1)),
                ("version", Value::Int(3)),
                ("price", Value::Double(80.0)),
            ])]
        });
        let log = conn.log();
        let mut node = Node::new("Book")
            .set("id", 10i64)
            .set("price", 80.0)
            .set("version", 3);
        let (_, affected) = ok(save(&catalog, &conn, &SaveOptions::new(), &mut node));
        assert!(affected.is_empty());
        assert_eq!(log.count_prefix("UPDATE"), 0);
        assert_eq!(node.scalar("version"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_changed_column_update_bumps_version() {
        let catalog = catalog();
        let conn = MockConnection::new().on_query("FROM \"book\"", |_| {
            vec![row(&[
                ("id", Value::BigInt(10)),
                ("version", Value::Int(3)),
                ("price", Value::Double(80.0)),
            ])]
        });
        let log = conn.log();
        let mut node = Node::new("Book")
            .set("id", 10i64)
            .set("price", 70.0)
            .set("version", 3);
        let (_, affected) = ok(save(&catalog, &conn, &SaveOptions::new(), &mut node));
        assert_eq!(affected.table("book"), 1);
        assert_eq!(
            log.sqls()[1],
            "UPDATE \"book\" SET \"price\" = $1, \"version\" = \"version\" + 1 WHERE \"id\" = $2 AND \"version\" = $3"
        );
        assert_eq!(node.scalar("version"), Some(&Value::Int(4)));
    }

    #[test]
    fn test_missing_version_fails_before_update() {
        let catalog = catalog();
        let conn = MockConnection::new().on_query("FROM \"book\"", |_| {
            vec![row(&[("id", Value::BigInt(10)), ("version", Value::Int(3))])]
        });
        let log = conn.log();
        let mut node = Node::new("Book").set("id", 10i64).set("price", 70.0);
        let error = err(save(&catalog, &conn, &SaveOptions::new(), &mut node));
        assert_eq!(error.save_error_kind(), Some(SaveErrorKind::MissingVersion));
        assert_eq!(log.count_prefix("UPDATE"), 0);
    }

    #[test]
    fn test_update_only_key_miss_is_skipped() {
        let catalog = catalog();
        let conn = MockConnection::new();
        let log = conn.log();
        let options = SaveOptions::new().mode(SaveMode::UpdateOnly);
        let mut node = Node::new("Book")
            .set("name", "Missing")
            .set("edition", 1)
            .set("price", 1.0);
        let (states, affected) = ok(save(&catalog, &conn, &options, &mut node));
        assert_eq!(states, vec![NodeState::Skipped]);
        assert!(affected.is_empty());
        assert_eq!(log.count_prefix("SELECT"), 1);
        assert_eq!(log.sqls().len(), 1);
    }

    #[test]
    fn test_missing_identity_issues_no_sql() {
        let catalog = catalog();
        let conn = MockConnection::new();
        let log = conn.log();
        for mode in [SaveMode::Upsert, SaveMode::InsertOnly, SaveMode::UpdateOnly] {
            let options = SaveOptions::new().mode(mode);
            let mut node = Node::new("Book").set("name", "SQL in Action").set("price", 1.0);
            let error = err(save(&catalog, &conn, &options, &mut node));
            assert_eq!(error.save_error_kind(), Some(SaveErrorKind::MissingIdentity));
        }
        assert!(log.sqls().is_empty());
    }

    #[test]
    fn test_strict_reference_check() {
        let catalog = catalog();
        let conn = MockConnection::new();
        let log = conn.log();
        let options = SaveOptions::new().id_check(crate::options::IdCheckLevel::All);
        let mut node = Node::new("Book")
            .set("name", "SQL in Action")
            .set("edition", 1)
            .set_one("store", Some(Node::reference("BookStore", "id", 99i64)));
        let error = err(save(&catalog, &conn, &options, &mut node));
        match error {
            Error::Save(SaveError::IllegalReferenceId {
                association,
                target,
                ids,
                path,
            }) => {
                assert_eq!(association, "store");
                assert_eq!(target, "BookStore");
                assert_eq!(ids, vec![Value::BigInt(99)]);
                assert_eq!(path.to_string(), "Book.store");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            log.sqls(),
            vec!["SELECT \"id\", \"name\" FROM \"book_store\" WHERE \"id\" IN ($1)".to_string()]
        );
    }
}
