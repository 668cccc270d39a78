//! Command configuration.
//!
//! [`SaveConfig`] holds the environment-wide defaults a caller passes to
//! every command; [`SaveOptions`] holds the per-command overrides. Neither is
//! global state: both are plain values threaded through the command.

use serde::{Deserialize, Serialize};
use savegraph_core::{
    AssociatedSaveMode, AssociationInfo, Catalog, ConfigError, DissociateAction, EntityInfo, Error,
    ForeignKeyKind,
};
use std::collections::HashMap;

/// Root save semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaveMode {
    /// Update when a matching row exists, insert otherwise.
    #[default]
    Upsert,
    /// Always insert; no existence check.
    InsertOnly,
    /// Always update; a missing row yields zero affected rows.
    UpdateOnly,
}

/// Concurrency control strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockMode {
    /// Version column predicates on UPDATE.
    #[default]
    Optimistic,
    /// Locking reads (`SELECT ... FOR UPDATE`) on existence checks.
    Pessimistic,
}

/// Which id-only references are checked for existence before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdCheckLevel {
    /// Never check; the database (or nothing) enforces references.
    #[default]
    None,
    /// Check only references through foreign keys the database does not enforce.
    Fake,
    /// Check every reference.
    All,
}

impl IdCheckLevel {
    /// Whether a reference through a column of `kind` is checked.
    pub const fn checks(&self, kind: ForeignKeyKind) -> bool {
        match self {
            IdCheckLevel::None => false,
            IdCheckLevel::Fake => matches!(kind, ForeignKeyKind::Fake),
            IdCheckLevel::All => true,
        }
    }
}

/// Environment-wide defaults for save and delete commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    /// Reconciliation policy for associations without a more specific one.
    pub associated_mode: AssociatedSaveMode,
    /// Concurrency control strategy.
    pub lock_mode: LockMode,
    /// Id-only reference checking.
    pub id_check: IdCheckLevel,
    /// Dissociation action for foreign keys that declare none.
    pub dissociate_action: Option<DissociateAction>,
    /// Maximum rows per multi-row statement or IN list.
    pub max_batch_rows: usize,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            associated_mode: AssociatedSaveMode::Replace,
            lock_mode: LockMode::Optimistic,
            id_check: IdCheckLevel::None,
            dissociate_action: None,
            max_batch_rows: 500,
        }
    }
}

impl SaveConfig {
    /// Parse a config from JSON; missing fields take their defaults.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: SaveConfig = serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid save config: {e}"),
                source: Some(Box::new(e)),
            })
        })?;
        if config.max_batch_rows == 0 {
            return Err(Error::Config(ConfigError::new(
                "max_batch_rows must be at least 1",
            )));
        }
        Ok(config)
    }

    /// Set the default associated save mode (builder pattern).
    #[must_use]
    pub fn associated_mode(mut self, mode: AssociatedSaveMode) -> Self {
        self.associated_mode = mode;
        self
    }

    /// Set the default lock mode (builder pattern).
    #[must_use]
    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Set the default id-check level (builder pattern).
    #[must_use]
    pub fn id_check(mut self, level: IdCheckLevel) -> Self {
        self.id_check = level;
        self
    }

    /// Set the fallback dissociation action (builder pattern).
    #[must_use]
    pub fn dissociate_action(mut self, action: DissociateAction) -> Self {
        self.dissociate_action = Some(action);
        self
    }

    /// Set the maximum rows per statement (builder pattern).
    #[must_use]
    pub fn max_batch_rows(mut self, rows: usize) -> Self {
        self.max_batch_rows = rows.max(1);
        self
    }
}

type PropKey = (&'static str, &'static str);

/// Per-command overrides.
///
/// Association-level settings are keyed by `(entity, association)`; for
/// dissociation that is the foreign key association on the child entity
/// (e.g. `("Book", "store")`).
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Root save mode.
    pub mode: SaveMode,
    /// Lock mode override.
    pub lock_mode: Option<LockMode>,
    /// Fail instead of waiting on locked rows (pessimistic mode only).
    pub nowait: bool,
    /// Associated save mode for every association.
    pub associated_mode: Option<AssociatedSaveMode>,
    /// Associated save mode for single associations.
    pub associated_modes: HashMap<PropKey, AssociatedSaveMode>,
    /// Dissociation action for every foreign key.
    pub dissociate_action: Option<DissociateAction>,
    /// Dissociation action for single foreign keys.
    pub dissociate_actions: HashMap<PropKey, DissociateAction>,
    /// Id-check level for every association.
    pub id_check: Option<IdCheckLevel>,
    /// Id-check level for single associations.
    pub id_checks: HashMap<PropKey, IdCheckLevel>,
    /// Business key override per entity.
    pub key_props: HashMap<&'static str, Vec<&'static str>>,
}

impl SaveOptions {
    /// Create new default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the root save mode (builder pattern).
    #[must_use]
    pub fn mode(mut self, mode: SaveMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the lock mode (builder pattern).
    #[must_use]
    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = Some(mode);
        self
    }

    /// Set the `nowait` option (builder pattern).
    #[must_use]
    pub fn nowait(mut self, value: bool) -> Self {
        self.nowait = value;
        self
    }

    /// Set the associated save mode for all associations (builder pattern).
    #[must_use]
    pub fn associated_mode(mut self, mode: AssociatedSaveMode) -> Self {
        self.associated_mode = Some(mode);
        self
    }

    /// Set the associated save mode for one association (builder pattern).
    #[must_use]
    pub fn associated_mode_for(
        mut self,
        entity: &'static str,
        association: &'static str,
        mode: AssociatedSaveMode,
    ) -> Self {
        self.associated_modes.insert((entity, association), mode);
        self
    }

    /// Set the dissociation action for all foreign keys (builder pattern).
    #[must_use]
    pub fn dissociate_action(mut self, action: DissociateAction) -> Self {
        self.dissociate_action = Some(action);
        self
    }

    /// Set the dissociation action for one foreign key (builder pattern).
    #[must_use]
    pub fn dissociate_action_for(
        mut self,
        entity: &'static str,
        association: &'static str,
        action: DissociateAction,
    ) -> Self {
        self.dissociate_actions.insert((entity, association), action);
        self
    }

    /// Set the id-check level for all associations (builder pattern).
    #[must_use]
    pub fn id_check(mut self, level: IdCheckLevel) -> Self {
        self.id_check = Some(level);
        self
    }

    /// Set the id-check level for one association (builder pattern).
    #[must_use]
    pub fn id_check_for(
        mut self,
        entity: &'static str,
        association: &'static str,
        level: IdCheckLevel,
    ) -> Self {
        self.id_checks.insert((entity, association), level);
        self
    }

    /// Override the business key of an entity for this command (builder pattern).
    #[must_use]
    pub fn key_props(mut self, entity: &'static str, props: Vec<&'static str>) -> Self {
        self.key_props.insert(entity, props);
        self
    }
}

/// Options and config merged for one command.
///
/// Lookups resolve most specific first: command per association, command
/// global, catalog per property, config.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Settings<'a> {
    config: &'a SaveConfig,
    options: &'a SaveOptions,
}

impl<'a> Settings<'a> {
    pub(crate) fn new(config: &'a SaveConfig, options: &'a SaveOptions) -> Self {
        Self { config, options }
    }

    /// Reject overrides naming entities or properties the catalog lacks.
    #[allow(clippy::result_large_err)]
    pub(crate) fn validate(&self, catalog: &Catalog) -> Result<(), Error> {
        let unknown = |what: String| Error::Config(ConfigError::new(what));

        for (entity, props) in &self.options.key_props {
            let info = catalog
                .entity(entity)
                .ok_or_else(|| unknown(format!("key override names unknown entity '{entity}'")))?;
            for prop in props {
                if info.find_field(prop).is_none() {
                    return Err(unknown(format!(
                        "key override names unknown property '{entity}.{prop}'"
                    )));
                }
            }
        }

        let assoc_keys = self
            .options
            .associated_modes
            .keys()
            .chain(self.options.dissociate_actions.keys())
            .chain(self.options.id_checks.keys());
        for (entity, association) in assoc_keys {
            let known = catalog
                .entity(entity)
                .is_some_and(|e| e.find_association(association).is_some());
            if !known {
                return Err(unknown(format!(
                    "option names unknown association '{entity}.{association}'"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn save_mode(&self) -> SaveMode {
        self.options.mode
    }

    pub(crate) fn lock_mode(&self) -> LockMode {
        self.options.lock_mode.unwrap_or(self.config.lock_mode)
    }

    pub(crate) fn nowait(&self) -> bool {
        self.options.nowait
    }

    pub(crate) fn max_batch_rows(&self) -> usize {
        self.config.max_batch_rows.max(1)
    }

    pub(crate) fn associated_mode(
        &self,
        owner: &EntityInfo,
        association: &AssociationInfo,
    ) -> AssociatedSaveMode {
        self.options
            .associated_modes
            .get(&(owner.name, association.name))
            .copied()
            .or(self.options.associated_mode)
            .or(association.save_mode)
            .unwrap_or(self.config.associated_mode)
    }

    /// Action for rows losing the foreign key `owner.association`.
    pub(crate) fn dissociate_action(
        &self,
        owner: &EntityInfo,
        association: &AssociationInfo,
    ) -> DissociateAction {
        self.options
            .dissociate_actions
            .get(&(owner.name, association.name))
            .copied()
            .or(self.options.dissociate_action)
            .or(association.on_dissociate)
            .or(self.config.dissociate_action)
            .unwrap_or_default()
    }

    pub(crate) fn id_check(&self, owner: &EntityInfo, association: &AssociationInfo) -> IdCheckLevel {
        self.options
            .id_checks
            .get(&(owner.name, association.name))
            .copied()
            .or(self.options.id_check)
            .unwrap_or(self.config.id_check)
    }

    /// Business key properties for `entity`, honoring the command override.
    pub(crate) fn key_props(&self, entity: &EntityInfo) -> Vec<&'static str> {
        match self.options.key_props.get(entity.name) {
            Some(props) => props.clone(),
            None => entity.key_props(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use savegraph_core::{FieldInfo, LinkTableInfo};

    fn catalog() -> Catalog {
        Catalog::builder()
            .entity(
                EntityInfo::new("BookStore", "book_store")
                    .field(FieldInfo::new("id", "id").primary_key(true))
                    .association(
                        AssociationInfo::one_to_many("books", "Book", "store")
                            .save_mode(AssociatedSaveMode::Merge),
                    ),
            )
            .entity(
                EntityInfo::new("Book", "book")
                    .field(FieldInfo::new("id", "id").primary_key(true))
                    .field(FieldInfo::new("name", "name").key(true))
                    .field(FieldInfo::new("isbn", "isbn"))
                    .association(
                        AssociationInfo::many_to_one("store", "BookStore", "store_id")
                            .nullable(true)
                            .on_dissociate(DissociateAction::SetNull),
                    )
                    .association(AssociationInfo::many_to_many(
                        "authors",
                        "Author",
                        LinkTableInfo::new("book_author_mapping", "book_id", "author_id"),
                    )),
            )
            .entity(
                EntityInfo::new("Author", "author")
                    .field(FieldInfo::new("id", "id").primary_key(true)),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = SaveConfig::default();
        assert_eq!(config.associated_mode, AssociatedSaveMode::Replace);
        assert_eq!(config.lock_mode, LockMode::Optimistic);
        assert_eq!(config.id_check, IdCheckLevel::None);
        assert_eq!(config.dissociate_action, None);
        assert_eq!(config.max_batch_rows, 500);
    }

    #[test]
    fn test_config_from_json() {
        let config =
            SaveConfig::from_json(r#"{"lock_mode": "PESSIMISTIC", "id_check": "FAKE"}"#).unwrap();
        assert_eq!(config.lock_mode, LockMode::Pessimistic);
        assert_eq!(config.id_check, IdCheckLevel::Fake);
        assert_eq!(config.max_batch_rows, 500);

        assert!(matches!(
            SaveConfig::from_json(r#"{"lock_mode": "SOMETIMES"}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            SaveConfig::from_json(r#"{"max_batch_rows": 0}"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_associated_mode_precedence() {
        let catalog = catalog();
        let store = catalog.entity("BookStore").unwrap();
        let books = store.find_association("books").unwrap();
        let book = catalog.entity("Book").unwrap();
        let authors = book.find_association("authors").unwrap();
        let config = SaveConfig::default();

        let options = SaveOptions::new();
        let settings = Settings::new(&config, &options);
        assert_eq!(settings.associated_mode(store, books), AssociatedSaveMode::Merge);
        assert_eq!(settings.associated_mode(book, authors), AssociatedSaveMode::Replace);

        let options = SaveOptions::new().associated_mode(AssociatedSaveMode::Append);
        let settings = Settings::new(&config, &options);
        assert_eq!(settings.associated_mode(store, books), AssociatedSaveMode::Append);

        let options = SaveOptions::new()
            .associated_mode(AssociatedSaveMode::Append)
            .associated_mode_for("BookStore", "books", AssociatedSaveMode::Replace);
        let settings = Settings::new(&config, &options);
        assert_eq!(settings.associated_mode(store, books), AssociatedSaveMode::Replace);
        assert_eq!(settings.associated_mode(book, authors), AssociatedSaveMode::Append);
    }

    #[test]
    fn test_dissociate_action_precedence() {
        let catalog = catalog();
        let book = catalog.entity("Book").unwrap();
        let store_fk = book.find_association("store").unwrap();
        let authors = book.find_association("authors").unwrap();

        let config = SaveConfig::default().dissociate_action(DissociateAction::Delete);
        let options = SaveOptions::new();
        let settings = Settings::new(&config, &options);
        assert_eq!(settings.dissociate_action(book, store_fk), DissociateAction::SetNull);
        assert_eq!(settings.dissociate_action(book, authors), DissociateAction::Delete);

        let options = SaveOptions::new().dissociate_action_for("Book", "store", DissociateAction::None);
        let settings = Settings::new(&config, &options);
        assert_eq!(settings.dissociate_action(book, store_fk), DissociateAction::None);
    }

    #[test]
    fn test_id_check_levels() {
        assert!(!IdCheckLevel::None.checks(ForeignKeyKind::Fake));
        assert!(IdCheckLevel::Fake.checks(ForeignKeyKind::Fake));
        assert!(!IdCheckLevel::Fake.checks(ForeignKeyKind::Real));
        assert!(IdCheckLevel::All.checks(ForeignKeyKind::Real));
    }

    #[test]
    fn test_key_props_override_and_validation() {
        let catalog = catalog();
        let book = catalog.entity("Book").unwrap();
        let config = SaveConfig::default();

        let options = SaveOptions::new().key_props("Book", vec!["isbn"]);
        let settings = Settings::new(&config, &options);
        assert!(settings.validate(&catalog).is_ok());
        assert_eq!(settings.key_props(book), vec!["isbn"]);

        let options = SaveOptions::new().key_props("Book", vec!["title"]);
        assert!(Settings::new(&config, &options).validate(&catalog).is_err());

        let options = SaveOptions::new().associated_mode_for("Book", "chapters", AssociatedSaveMode::Merge);
        assert!(Settings::new(&config, &options).validate(&catalog).is_err());
    }
}
