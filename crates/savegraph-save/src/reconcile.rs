//! Association reconciliation.
//!
//! - many-to-one: targets are saved before their owners so the FK value is
//!   known when the owner's row is written
//! - one-to-many / inverse one-to-one: children are saved after the parent
//!   with the parent's id in their FK column; REPLACE then dissociates the
//!   children no longer present
//! - many-to-many: targets are saved, then join rows are inserted (and, for
//!   REPLACE, stale ones removed). Target rows are never deleted here.
//!
//! Id-only references are linked without touching the target row. Whether
//! they are checked for existence first depends on the id-check level.

use crate::engine::{Candidate, RowMode, Saver};
use crate::plan::LinkTableOp;
use crate::sql::{Params, select};
use crate::state::{BatchStates, NodeState};
use asupersync::Outcome;
use savegraph_core::{
    AssociatedSaveMode, AssociationInfo, Connection, EntityInfo, Error, RowKey, SavePath, Value,
    quote_ident,
};
use std::collections::HashSet;

/// Children of one association gathered across a batch, split into
/// id-only references and long nodes, remembering the walk order.
struct Gathered<'n> {
    references: Vec<Candidate<'n>>,
    long: Vec<Candidate<'n>>,
    /// `true` for a reference, in walk order.
    order: Vec<bool>,
}

impl<'n> Gathered<'n> {
    fn new() -> Self {
        Self {
            references: Vec::new(),
            long: Vec::new(),
            order: Vec::new(),
        }
    }

    fn push(&mut self, candidate: Candidate<'n>, id_prop: &str) {
        let reference = candidate.node.is_reference(id_prop);
        self.order.push(reference);
        if reference {
            self.references.push(candidate);
        } else {
            self.long.push(candidate);
        }
    }
}

/// Zip the walk order back with the per-kind states.
fn walk_states(order: &[bool], references: &[NodeState], long: &[NodeState]) -> Vec<NodeState> {
    let mut references = references.iter();
    let mut long = long.iter();
    order
        .iter()
        .map(|reference| {
            let next = if *reference {
                references.next()
            } else {
                long.next()
            };
            next.copied().unwrap_or(NodeState::Skipped)
        })
        .collect()
}

impl<'a, C: Connection> Saver<'a, C> {
    /// Save many-to-one targets of a batch ahead of the batch itself.
    pub(crate) async fn save_foreign_key_targets(
        &mut self,
        owner: &'a EntityInfo,
        batch: &mut [Candidate<'_>],
        mode: RowMode,
        path: &SavePath,
    ) -> Outcome<(), Error> {
        if matches!(mode, RowMode::Reference { .. }) {
            return Outcome::Ok(());
        }
        let catalog = self.catalog;
        for association in &owner.associations {
            let Some(column) = association.foreign_key_column() else {
                continue;
            };
            let Some(target) = catalog.entity(association.target) else {
                continue;
            };
            let associated_mode = self.settings.associated_mode(owner, association);
            let checked = associated_mode != AssociatedSaveMode::Append
                && self
                    .settings
                    .id_check(owner, association)
                    .checks(association.foreign_key);

            let mut gathered = Gathered::new();
            for candidate in batch.iter_mut() {
                let parent_owned = candidate
                    .parent_fk
                    .as_ref()
                    .is_some_and(|(parent_column, _)| *parent_column == column);
                if parent_owned {
                    continue;
                }
                for child in candidate.node.children_mut(association.name) {
                    gathered.push(Candidate::new(child), target.id().name);
                }
            }

            let child_path = path.child(association.name);
            if checked && !gathered.references.is_empty() {
                try_outcome!(
                    self.save_batch(
                        target,
                        gathered.references,
                        RowMode::Reference { strict: true },
                        child_path.clone(),
                    )
                    .await
                );
            }
            if !gathered.long.is_empty() {
                try_outcome!(
                    self.save_batch(
                        target,
                        gathered.long,
                        RowMode::children(associated_mode),
                        child_path,
                    )
                    .await
                );
            }
        }
        Outcome::Ok(())
    }

    /// Save the children of an inverse association and dissociate orphans.
    pub(crate) async fn reconcile_inverse(
        &mut self,
        owner: &'a EntityInfo,
        association: &'a AssociationInfo,
        batch: &mut [Candidate<'_>],
        states: &BatchStates,
        inserted: &[bool],
        path: &SavePath,
    ) -> Outcome<(), Error> {
        let catalog = self.catalog;
        let Some((child_entity, foreign_key)) = catalog.mapped_by(association) else {
            return Outcome::Ok(());
        };
        let Some(fk_column) = foreign_key.foreign_key_column() else {
            return Outcome::Ok(());
        };
        let mode = self.settings.associated_mode(owner, association);
        let strict = self
            .settings
            .id_check(owner, association)
            .checks(association.foreign_key);
        let owner_id = owner.id().name;
        let child_id = child_entity.id().name;
        let child_path = path.child(association.name);

        let parents: Vec<usize> = (0..batch.len())
            .filter(|&i| {
                states.get(i).has_row()
                    && batch[i].node.is_loaded(association.name)
                    && batch[i].node.non_null(owner_id).is_some()
            })
            .collect();
        if parents.is_empty() {
            return Outcome::Ok(());
        }

        let mut gathered = Gathered::new();
        for (i, candidate) in batch.iter_mut().enumerate() {
            if !parents.contains(&i) {
                continue;
            }
            let Some(parent_id) = candidate.node.non_null(owner_id).cloned() else {
                continue;
            };
            for child in candidate.node.children_mut(association.name) {
                gathered.push(Candidate::child(child, fk_column, parent_id.clone()), child_id);
            }
        }

        // References only move their FK: APPEND writes it blindly, the other
        // modes read first so an unchanged link costs no UPDATE.
        let reference_mode = if mode == AssociatedSaveMode::Append {
            RowMode::UpdateOnly
        } else {
            RowMode::Reference { strict }
        };
        let order = gathered.order;
        let reference_states = if gathered.references.is_empty() {
            Vec::new()
        } else {
            try_outcome!(
                self.save_batch(
                    child_entity,
                    gathered.references,
                    reference_mode,
                    child_path.clone(),
                )
                .await
            )
        };
        let long_states = if gathered.long.is_empty() {
            Vec::new()
        } else {
            try_outcome!(
                self.save_batch(
                    child_entity,
                    gathered.long,
                    RowMode::children(mode),
                    child_path.clone(),
                )
                .await
            )
        };

        if !mode.dissociates() {
            return Outcome::Ok(());
        }

        // Children now linked to each parent; new parents have nothing to orphan.
        let child_states = walk_states(&order, &reference_states, &long_states);
        let mut child_states = child_states.into_iter();
        let mut parent_ids = Vec::new();
        let mut retained = Vec::new();
        for &i in &parents {
            let node = &batch[i].node;
            for child in node.children(association.name) {
                let state = child_states.next().unwrap_or(NodeState::Skipped);
                if state.has_row() {
                    if let Some(id) = child.non_null(child_id) {
                        retained.push(id.clone());
                    }
                }
            }
            if !inserted[i] {
                if let Some(id) = node.non_null(owner_id) {
                    parent_ids.push(id.clone());
                }
            }
        }
        if parent_ids.is_empty() {
            return Outcome::Ok(());
        }

        let orphans = try_outcome!(
            self.find_orphans(child_entity, fk_column, &parent_ids, &retained, &child_path)
                .await
        );
        self.dissociate(child_entity, foreign_key, orphans, &child_path)
            .await
    }

    /// Save the targets of a join-table association and sync its links.
    pub(crate) async fn reconcile_join_table(
        &mut self,
        owner: &'a EntityInfo,
        association: &'a AssociationInfo,
        batch: &mut [Candidate<'_>],
        states: &BatchStates,
        inserted: &[bool],
        path: &SavePath,
    ) -> Outcome<(), Error> {
        let catalog = self.catalog;
        let Some(link) = association.link_table() else {
            return Outcome::Ok(());
        };
        let Some(target) = catalog.entity(association.target) else {
            return Outcome::Ok(());
        };
        let mode = self.settings.associated_mode(owner, association);
        let checked = mode != AssociatedSaveMode::Append
            && self
                .settings
                .id_check(owner, association)
                .checks(association.foreign_key);
        let owner_id = owner.id().name;
        let target_id = target.id().name;
        let child_path = path.child(association.name);

        let parents: Vec<usize> = (0..batch.len())
            .filter(|&i| {
                states.get(i).has_row()
                    && batch[i].node.is_loaded(association.name)
                    && batch[i].node.non_null(owner_id).is_some()
            })
            .collect();
        if parents.is_empty() {
            return Outcome::Ok(());
        }

        let mut gathered = Gathered::new();
        for (i, candidate) in batch.iter_mut().enumerate() {
            if !parents.contains(&i) {
                continue;
            }
            for child in candidate.node.children_mut(association.name) {
                gathered.push(Candidate::new(child), target_id);
            }
        }

        let order = gathered.order;
        let reference_count = gathered.references.len();
        let reference_states = if checked && reference_count > 0 {
            try_outcome!(
                self.save_batch(
                    target,
                    gathered.references,
                    RowMode::Reference { strict: true },
                    child_path.clone(),
                )
                .await
            )
        } else {
            vec![NodeState::Reconciled; reference_count]
        };
        let long_states = if gathered.long.is_empty() {
            Vec::new()
        } else {
            try_outcome!(
                self.save_batch(
                    target,
                    gathered.long,
                    RowMode::children(mode),
                    child_path.clone(),
                )
                .await
            )
        };

        // Desired (parent, target) pairs in walk order.
        let child_states = walk_states(&order, &reference_states, &long_states);
        let mut child_states = child_states.into_iter();
        let mut desired: Vec<(Value, Value)> = Vec::new();
        let mut desired_keys = HashSet::new();
        let mut read_parents = Vec::new();
        for &i in &parents {
            let node = &batch[i].node;
            let Some(parent_id) = node.non_null(owner_id).cloned() else {
                continue;
            };
            for child in node.children(association.name) {
                let state = child_states.next().unwrap_or(NodeState::Skipped);
                let Some(id) = child.non_null(target_id) else {
                    continue;
                };
                let key = RowKey::new(vec![parent_id.clone(), id.clone()]);
                if state.has_row() && desired_keys.insert(key) {
                    desired.push((parent_id.clone(), id.clone()));
                }
            }
            if mode.reads_existing() && !inserted[i] {
                read_parents.push(parent_id);
            }
        }

        let existing = if read_parents.is_empty() {
            Vec::new()
        } else {
            try_outcome!(
                self.existing_links(
                    link.table_name,
                    link.local_column,
                    link.remote_column,
                    &read_parents,
                    &child_path,
                )
                .await
            )
        };
        let existing_keys: HashSet<RowKey> = existing
            .iter()
            .map(|(local, remote)| RowKey::new(vec![local.clone(), remote.clone()]))
            .collect();

        let mut links = Vec::new();
        for (local, remote) in desired {
            let key = RowKey::new(vec![local.clone(), remote.clone()]);
            if !existing_keys.contains(&key) {
                links.push(LinkTableOp::Link {
                    table: link.table_name,
                    local_column: link.local_column,
                    local_value: local,
                    remote_column: link.remote_column,
                    remote_value: remote,
                });
            }
        }
        if mode.dissociates() {
            for (local, remote) in existing {
                let key = RowKey::new(vec![local.clone(), remote.clone()]);
                if !desired_keys.contains(&key) {
                    links.push(LinkTableOp::Unlink {
                        table: link.table_name,
                        local_column: link.local_column,
                        local_value: local,
                        remote_column: link.remote_column,
                        remote_value: remote,
                    });
                }
            }
        }

        tracing::debug!(
            association = association.name,
            table = link.table_name,
            changes = links.len(),
            "Reconciled join table"
        );
        self.flush(Vec::new(), links, &child_path).await.map(|_| ())
    }

    /// Current `(local, remote)` pairs of a join table for the given parents.
    async fn existing_links(
        &self,
        table: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
        parents: &[Value],
        path: &SavePath,
    ) -> Outcome<Vec<(Value, Value)>, Error> {
        let mut pairs = Vec::new();
        for chunk in parents.chunks(self.settings.max_batch_rows()) {
            let mut params = Params::new();
            let list = params.list(chunk.iter().cloned());
            let sql = select(
                table,
                &[local_column, remote_column],
                &format!("{} IN ({})", quote_ident(local_column), list),
            );
            tracing::trace!(sql = %sql, "Reading join table");
            let rows = try_select!(
                self.conn.query(self.cx, &sql, &params.into_values()).await,
                path,
                table
            );
            for row in rows {
                let local = row.get_by_name(local_column).cloned().unwrap_or(Value::Null);
                let remote = row.get_by_name(remote_column).cloned().unwrap_or(Value::Null);
                pairs.push((local, remote));
            }
        }
        Outcome::Ok(pairs)
    }
}
