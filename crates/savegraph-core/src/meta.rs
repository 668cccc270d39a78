//! Entity metadata catalog.
//!
//! The catalog describes, for every entity type, its table, scalar columns,
//! primary key, business key, optimistic-lock version column and
//! associations. It is built once through [`CatalogBuilder`], validated as a
//! whole, and then shared read-only by every command.

use crate::error::{ConfigError, Error, Result};
use crate::identifiers::validate_identifier;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Reconciliation policy for an association's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssociatedSaveMode {
    /// Insert every child, never read, never dissociate.
    Append,
    /// Insert or update children by identity, keep the rest.
    Merge,
    /// Merge, then dissociate children no longer referenced.
    #[default]
    Replace,
}

impl AssociatedSaveMode {
    /// Whether children must be resolved against existing rows.
    pub const fn reads_existing(&self) -> bool {
        !matches!(self, AssociatedSaveMode::Append)
    }

    /// Whether orphaned children are dissociated afterwards.
    pub const fn dissociates(&self) -> bool {
        matches!(self, AssociatedSaveMode::Replace)
    }
}

/// What happens to a child row whose link to its parent is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DissociateAction {
    /// Refuse: the command fails with `DissociationNotAllowed`.
    #[default]
    None,
    /// Clear the child's foreign key column.
    SetNull,
    /// Delete the child row, cascading into its own associations.
    Delete,
}

/// Whether a foreign key column is enforced by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForeignKeyKind {
    /// Backed by a database constraint.
    #[default]
    Real,
    /// A plain column the database does not check.
    Fake,
}

/// Scalar column of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Property name used on nodes
    pub name: &'static str,
    /// Database column name (may differ from the property name)
    pub column_name: &'static str,
    /// Whether this column accepts NULL
    pub nullable: bool,
    /// Whether this is the primary key
    pub primary_key: bool,
    /// Whether the database assigns the value on insert
    pub generated: bool,
    /// Whether this is the optimistic-lock version column
    pub version: bool,
    /// Whether this column is part of the business key
    pub key: bool,
}

impl FieldInfo {
    /// Create a plain non-nullable column.
    pub const fn new(name: &'static str, column_name: &'static str) -> Self {
        Self {
            name,
            column_name,
            nullable: false,
            primary_key: false,
            generated: false,
            version: false,
            key: false,
        }
    }

    /// Set nullable flag.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set primary key flag.
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    /// Set generated (database-assigned) flag.
    pub const fn generated(mut self, value: bool) -> Self {
        self.generated = value;
        self
    }

    /// Set version flag.
    pub const fn version(mut self, value: bool) -> Self {
        self.version = value;
        self
    }

    /// Set business key membership.
    pub const fn key(mut self, value: bool) -> Self {
        self.key = value;
        self
    }
}

/// Join table linking two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"book_author_mapping"`).
    pub table_name: &'static str,
    /// Column pointing to the owning entity (e.g., `"book_id"`).
    pub local_column: &'static str,
    /// Column pointing to the target entity (e.g., `"author_id"`).
    pub remote_column: &'static str,
}

impl LinkTableInfo {
    /// Create a new link-table definition.
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            local_column,
            remote_column,
        }
    }
}

/// How an association is materialized in the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationShape {
    /// Column on the owning table referencing the target's primary key.
    ForeignKey { column: &'static str },
    /// The target owns the column; `mapped_by` names its `ForeignKey`
    /// association pointing back here.
    Inverse { mapped_by: &'static str },
    /// Rows in a join table.
    JoinTable(LinkTableInfo),
}

/// An association from one entity to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationInfo {
    /// Property name used on nodes
    pub name: &'static str,
    /// Target entity name
    pub target: &'static str,
    /// Schema representation
    pub shape: AssociationShape,
    /// To-many (`true`) or to-one
    pub list: bool,
    /// Enforcement of the column materializing this association.
    ///
    /// For inverse associations this is copied from the mapped foreign key
    /// when the catalog is built.
    pub foreign_key: ForeignKeyKind,
    /// Whether the foreign key column accepts NULL (`ForeignKey` shape only)
    pub nullable: bool,
    /// Dissociation action for rows losing this link (`ForeignKey` shape only)
    pub on_dissociate: Option<DissociateAction>,
    /// Default reconciliation policy for this association
    pub save_mode: Option<AssociatedSaveMode>,
}

impl AssociationInfo {
    const fn with_shape(
        name: &'static str,
        target: &'static str,
        shape: AssociationShape,
        list: bool,
    ) -> Self {
        Self {
            name,
            target,
            shape,
            list,
            foreign_key: ForeignKeyKind::Real,
            nullable: false,
            on_dissociate: None,
            save_mode: None,
        }
    }

    /// To-one association through a column on the owning table.
    pub const fn many_to_one(name: &'static str, target: &'static str, column: &'static str) -> Self {
        Self::with_shape(name, target, AssociationShape::ForeignKey { column }, false)
    }

    /// To-many association owned by the target's foreign key.
    pub const fn one_to_many(
        name: &'static str,
        target: &'static str,
        mapped_by: &'static str,
    ) -> Self {
        Self::with_shape(name, target, AssociationShape::Inverse { mapped_by }, true)
    }

    /// To-one association owned by the target's foreign key.
    pub const fn one_to_one_inverse(
        name: &'static str,
        target: &'static str,
        mapped_by: &'static str,
    ) -> Self {
        Self::with_shape(name, target, AssociationShape::Inverse { mapped_by }, false)
    }

    /// To-many association through a join table.
    pub const fn many_to_many(name: &'static str, target: &'static str, link: LinkTableInfo) -> Self {
        Self::with_shape(name, target, AssociationShape::JoinTable(link), true)
    }

    /// Mark the column as not enforced by the database.
    pub const fn fake_foreign_key(mut self) -> Self {
        self.foreign_key = ForeignKeyKind::Fake;
        self
    }

    /// Set nullable flag of the foreign key column.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set the dissociation action for rows losing this link.
    pub const fn on_dissociate(mut self, action: DissociateAction) -> Self {
        self.on_dissociate = Some(action);
        self
    }

    /// Set the default reconciliation policy.
    pub const fn save_mode(mut self, mode: AssociatedSaveMode) -> Self {
        self.save_mode = Some(mode);
        self
    }

    /// Whether a column (on the owning table or a join table) materializes
    /// this association.
    pub const fn has_target_foreign_key(&self) -> bool {
        !matches!(self.shape, AssociationShape::Inverse { .. })
    }

    /// The owning-table column, for `ForeignKey` associations.
    pub const fn foreign_key_column(&self) -> Option<&'static str> {
        match self.shape {
            AssociationShape::ForeignKey { column } => Some(column),
            _ => None,
        }
    }

    /// The join table, for `JoinTable` associations.
    pub const fn link_table(&self) -> Option<&LinkTableInfo> {
        match &self.shape {
            AssociationShape::JoinTable(link) => Some(link),
            _ => None,
        }
    }
}

/// Metadata for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    /// Entity name, used to tag nodes
    pub name: &'static str,
    /// Table name
    pub table: &'static str,
    /// Scalar columns, in declaration order
    pub fields: Vec<FieldInfo>,
    /// Associations, in declaration order
    pub associations: Vec<AssociationInfo>,
    id_index: usize,
}

impl EntityInfo {
    /// Start describing an entity stored in `table`.
    pub fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            fields: Vec::new(),
            associations: Vec::new(),
            id_index: 0,
        }
    }

    /// Add a scalar column.
    #[must_use]
    pub fn field(mut self, field: FieldInfo) -> Self {
        self.fields.push(field);
        self
    }

    /// Add an association.
    #[must_use]
    pub fn association(mut self, association: AssociationInfo) -> Self {
        self.associations.push(association);
        self
    }

    /// The primary key column.
    ///
    /// Only meaningful on entities obtained from a built [`Catalog`].
    pub fn id(&self) -> &FieldInfo {
        &self.fields[self.id_index]
    }

    /// The optimistic-lock version column, if any.
    pub fn version(&self) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.version)
    }

    /// Business key columns, in declaration order.
    pub fn key_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| f.key)
    }

    /// Business key property names, in declaration order.
    pub fn key_props(&self) -> Vec<&'static str> {
        self.key_fields().map(|f| f.name).collect()
    }

    /// Look up a scalar column by property name.
    pub fn find_field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up an association by property name.
    pub fn find_association(&self, name: &str) -> Option<&AssociationInfo> {
        self.associations.iter().find(|a| a.name == name)
    }

    fn property_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields
            .iter()
            .map(|f| f.name)
            .chain(self.associations.iter().map(|a| a.name))
    }
}

/// An association on another entity that points at a given entity.
///
/// Deleting a row of the pointed-at entity must first deal with these.
#[derive(Debug, Clone, Copy)]
pub enum BackReference<'c> {
    /// `owner.association` is a foreign key column referencing the row.
    ForeignKey {
        owner: &'c EntityInfo,
        association: &'c AssociationInfo,
    },
    /// A join table row references the row through `column`.
    JoinTable {
        link: &'c LinkTableInfo,
        column: &'static str,
    },
}

/// Validated, read-only metadata for all entity types.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entities: BTreeMap<&'static str, EntityInfo>,
}

impl Catalog {
    /// Start building a catalog.
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Look up an entity by name.
    pub fn entity(&self, name: &str) -> Option<&EntityInfo> {
        self.entities.get(name)
    }

    /// All entities, ordered by name.
    pub fn entities(&self) -> impl Iterator<Item = &EntityInfo> {
        self.entities.values()
    }

    /// For an inverse association, the target entity and its foreign key
    /// association that owns the column.
    pub fn mapped_by(&self, association: &AssociationInfo) -> Option<(&EntityInfo, &AssociationInfo)> {
        let AssociationShape::Inverse { mapped_by } = association.shape else {
            return None;
        };
        let target = self.entities.get(association.target)?;
        let fk = target.find_association(mapped_by)?;
        Some((target, fk))
    }

    /// Every association elsewhere in the catalog that references rows of
    /// `entity`: foreign key columns on other (or the same) tables, and join
    /// table columns on either side.
    pub fn back_references(&self, entity: &str) -> Vec<BackReference<'_>> {
        let mut refs = Vec::new();
        let mut seen_links = HashSet::new();
        for owner in self.entities.values() {
            for association in &owner.associations {
                match &association.shape {
                    AssociationShape::ForeignKey { .. } if association.target == entity => {
                        refs.push(BackReference::ForeignKey { owner, association });
                    }
                    AssociationShape::JoinTable(link) => {
                        if owner.name == entity && seen_links.insert((link.table_name, link.local_column)) {
                            refs.push(BackReference::JoinTable {
                                link,
                                column: link.local_column,
                            });
                        }
                        if association.target == entity
                            && seen_links.insert((link.table_name, link.remote_column))
                        {
                            refs.push(BackReference::JoinTable {
                                link,
                                column: link.remote_column,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        refs
    }

    /// Table -> tables it holds a foreign key to.
    ///
    /// Join tables depend on both sides. Self references are omitted.
    pub fn table_dependencies(&self) -> Vec<(&'static str, Vec<&'static str>)> {
        let mut deps: BTreeMap<&'static str, BTreeSet<&'static str>> = BTreeMap::new();
        for owner in self.entities.values() {
            deps.entry(owner.table).or_default();
            for association in &owner.associations {
                let Some(target) = self.entities.get(association.target) else {
                    continue;
                };
                match &association.shape {
                    AssociationShape::ForeignKey { .. } => {
                        if target.table != owner.table {
                            deps.entry(owner.table).or_default().insert(target.table);
                        }
                    }
                    AssociationShape::JoinTable(link) => {
                        let entry = deps.entry(link.table_name).or_default();
                        entry.insert(owner.table);
                        entry.insert(target.table);
                    }
                    AssociationShape::Inverse { .. } => {}
                }
            }
        }
        deps.into_iter()
            .map(|(table, to)| (table, to.into_iter().collect()))
            .collect()
    }
}

/// Collects entity descriptions and validates them into a [`Catalog`].
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    entities: Vec<EntityInfo>,
}

fn config_error(message: String) -> Error {
    Error::Config(ConfigError::new(message))
}

impl CatalogBuilder {
    /// Add an entity description.
    #[must_use]
    pub fn entity(mut self, entity: EntityInfo) -> Self {
        self.entities.push(entity);
        self
    }

    /// Validate and freeze the catalog.
    ///
    /// Fails with [`Error::Config`] on duplicate names, invalid identifiers,
    /// a missing or repeated primary key, more than one version column,
    /// unknown targets, unresolvable `mapped_by`, `SET_NULL` on a
    /// non-nullable column, or a cascade-delete cycle across entity types.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<Catalog> {
        let mut entities = BTreeMap::new();
        for mut entity in self.entities {
            Self::check_entity(&mut entity)?;
            if entities.contains_key(entity.name) {
                return Err(config_error(format!(
                    "entity '{}' declared twice",
                    entity.name
                )));
            }
            entities.insert(entity.name, entity);
        }

        let mut catalog = Catalog { entities };
        Self::resolve_associations(&mut catalog)?;
        Self::check_cascade_cycles(&catalog)?;

        tracing::debug!(
            entities = catalog.entities.len(),
            "Entity catalog built"
        );
        Ok(catalog)
    }

    #[allow(clippy::result_large_err)]
    fn check_entity(entity: &mut EntityInfo) -> Result<()> {
        validate_identifier(entity.name, "entity")?;
        validate_identifier(entity.table, "table")?;

        let mut names = HashSet::new();
        for name in entity.property_names() {
            if !names.insert(name) {
                return Err(config_error(format!(
                    "property '{}.{}' declared twice",
                    entity.name, name
                )));
            }
        }

        for field in &entity.fields {
            validate_identifier(field.column_name, "column")?;
            if field.version && (field.primary_key || field.key) {
                return Err(config_error(format!(
                    "version column '{}.{}' cannot be part of a key",
                    entity.name, field.name
                )));
            }
        }

        let pks: Vec<usize> = entity
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.primary_key)
            .map(|(i, _)| i)
            .collect();
        match pks.as_slice() {
            [id] => entity.id_index = *id,
            [] => {
                return Err(config_error(format!(
                    "entity '{}' has no primary key",
                    entity.name
                )));
            }
            _ => {
                return Err(config_error(format!(
                    "entity '{}' declares more than one primary key column",
                    entity.name
                )));
            }
        }

        if entity.fields.iter().filter(|f| f.version).count() > 1 {
            return Err(config_error(format!(
                "entity '{}' declares more than one version column",
                entity.name
            )));
        }

        for association in &entity.associations {
            match &association.shape {
                AssociationShape::ForeignKey { column } => {
                    validate_identifier(column, "column")?;
                    if association.list {
                        return Err(config_error(format!(
                            "foreign key association '{}.{}' cannot be a list",
                            entity.name, association.name
                        )));
                    }
                    if association.on_dissociate == Some(DissociateAction::SetNull)
                        && !association.nullable
                    {
                        return Err(config_error(format!(
                            "'{}.{}' uses SET_NULL but column '{}' is not nullable",
                            entity.name, association.name, column
                        )));
                    }
                }
                AssociationShape::JoinTable(link) => {
                    validate_identifier(link.table_name, "table")?;
                    validate_identifier(link.local_column, "column")?;
                    validate_identifier(link.remote_column, "column")?;
                }
                AssociationShape::Inverse { .. } => {}
            }
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn resolve_associations(catalog: &mut Catalog) -> Result<()> {
        let mut inverse_kinds = Vec::new();
        for entity in catalog.entities.values() {
            for (index, association) in entity.associations.iter().enumerate() {
                let Some(target) = catalog.entities.get(association.target) else {
                    return Err(config_error(format!(
                        "'{}.{}' targets unknown entity '{}'",
                        entity.name, association.name, association.target
                    )));
                };
                if let AssociationShape::Inverse { mapped_by } = association.shape {
                    let fk = target
                        .find_association(mapped_by)
                        .filter(|fk| fk.foreign_key_column().is_some() && fk.target == entity.name)
                        .ok_or_else(|| {
                            config_error(format!(
                                "'{}.{}' is mapped by '{}.{}', which is not a foreign key back to '{}'",
                                entity.name, association.name, target.name, mapped_by, entity.name
                            ))
                        })?;
                    inverse_kinds.push((entity.name, index, fk.foreign_key));
                }
            }
        }
        for (name, index, kind) in inverse_kinds {
            if let Some(association) = catalog
                .entities
                .get_mut(name)
                .and_then(|e| e.associations.get_mut(index))
            {
                association.foreign_key = kind;
            }
        }
        Ok(())
    }

    /// Reject DELETE cascades that loop through two or more entity types.
    #[allow(clippy::result_large_err)]
    fn check_cascade_cycles(catalog: &Catalog) -> Result<()> {
        // Edge parent -> child when deleting a parent deletes child rows.
        let mut edges: BTreeMap<&'static str, BTreeSet<&'static str>> = BTreeMap::new();
        for child in catalog.entities.values() {
            for association in &child.associations {
                if association.foreign_key_column().is_some()
                    && association.on_dissociate == Some(DissociateAction::Delete)
                    && association.target != child.name
                {
                    edges.entry(association.target).or_default().insert(child.name);
                }
            }
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            node: &'static str,
            edges: &BTreeMap<&'static str, BTreeSet<&'static str>>,
            marks: &mut BTreeMap<&'static str, Mark>,
            stack: &mut Vec<&'static str>,
        ) -> Option<Vec<&'static str>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(node);
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            stack.push(node);
            if let Some(next) = edges.get(node) {
                for child in next {
                    if let Some(cycle) = visit(*child, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        for start in edges.keys() {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(*start, &edges, &mut marks, &mut stack) {
                return Err(config_error(format!(
                    "cascade delete cycle: {}",
                    cycle.join(" -> ")
                )));
            }
        }
        Ok(())
    }
}
