//! Concurrency guard.
//!
//! Optimistic mode attaches version predicates to UPDATEs and turns a zero
//! affected-row count into [`SaveError::OptimisticLockViolation`].
//! Pessimistic mode renders existence-check SELECTs as locking reads; the
//! locks live until the caller's transaction ends.

use crate::options::LockMode;
use savegraph_core::{EntityInfo, SavePath, SaveError, Value};

#[derive(Debug, Clone, Copy)]
pub(crate) struct ConcurrencyGuard {
    mode: LockMode,
    nowait: bool,
}

impl ConcurrencyGuard {
    pub(crate) fn new(mode: LockMode, nowait: bool) -> Self {
        Self { mode, nowait }
    }

    pub(crate) fn mode(&self) -> LockMode {
        self.mode
    }

    /// Append the locking clause, if any, to an existence-check SELECT.
    pub(crate) fn annotate_select(&self, sql: &mut String) {
        if self.mode == LockMode::Pessimistic {
            sql.push_str(" FOR UPDATE");
            if self.nowait {
                sql.push_str(" NOWAIT");
            }
        }
    }

    /// Version to compare against in an UPDATE of row `id`.
    ///
    /// `None` means the UPDATE carries no version predicate.
    pub(crate) fn version_predicate(
        &self,
        entity: &EntityInfo,
        id: &Value,
        supplied: Option<&Value>,
        path: &SavePath,
    ) -> Result<Option<Value>, SaveError> {
        if entity.version().is_none() || self.mode == LockMode::Pessimistic {
            return Ok(None);
        }
        match supplied {
            Some(version) if !version.is_null() => Ok(Some(version.clone())),
            _ => Err(SaveError::MissingVersion {
                path: path.clone(),
                entity: entity.name,
                id: id.clone(),
            }),
        }
    }

    /// Version written by an INSERT.
    pub(crate) fn insert_version(supplied: Option<&Value>) -> Value {
        match supplied {
            Some(version) if !version.is_null() => version.clone(),
            _ => Value::BigInt(0),
        }
    }

    /// Check the affected-row count of a versioned UPDATE.
    pub(crate) fn verify_update(
        entity: &EntityInfo,
        id: &Value,
        version: Option<&Value>,
        affected: u64,
        path: &SavePath,
    ) -> Result<(), SaveError> {
        match version {
            Some(version) if affected == 0 => Err(SaveError::OptimisticLockViolation {
                path: path.clone(),
                entity: entity.name,
                id: id.clone(),
                version: version.clone(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use savegraph_core::{FieldInfo, SaveErrorKind};

    fn versioned() -> EntityInfo {
        EntityInfo::new("Book", "book")
            .field(FieldInfo::new("id", "id").primary_key(true))
            .field(FieldInfo::new("version", "version").version(true))
    }

    fn unversioned() -> EntityInfo {
        EntityInfo::new("Tag", "tag").field(FieldInfo::new("id", "id").primary_key(true))
    }

    #[test]
    fn test_locking_clause() {
        let mut sql = String::from("SELECT \"id\" FROM \"book\" WHERE \"id\" IN ($1)");
        ConcurrencyGuard::new(LockMode::Optimistic, false).annotate_select(&mut sql);
        assert!(!sql.contains("FOR UPDATE"));

        ConcurrencyGuard::new(LockMode::Pessimistic, false).annotate_select(&mut sql);
        assert!(sql.ends_with(" FOR UPDATE"));

        let mut sql = String::from("SELECT 1");
        ConcurrencyGuard::new(LockMode::Pessimistic, true).annotate_select(&mut sql);
        assert_eq!(sql, "SELECT 1 FOR UPDATE NOWAIT");
    }

    #[test]
    fn test_optimistic_requires_version() {
        let guard = ConcurrencyGuard::new(LockMode::Optimistic, false);
        let path = SavePath::root("Book");
        let id = Value::BigInt(101);

        let version = guard
            .version_predicate(&versioned(), &id, Some(&Value::BigInt(3)), &path)
            .unwrap();
        assert_eq!(version, Some(Value::BigInt(3)));

        let err = guard
            .version_predicate(&versioned(), &id, None, &path)
            .unwrap_err();
        assert_eq!(err.kind(), SaveErrorKind::MissingVersion);

        let err = guard
            .version_predicate(&versioned(), &id, Some(&Value::Null), &path)
            .unwrap_err();
        assert_eq!(err.kind(), SaveErrorKind::MissingVersion);

        assert_eq!(
            guard.version_predicate(&unversioned(), &id, None, &path).unwrap(),
            None
        );
    }

    #[test]
    fn test_pessimistic_skips_version_predicate() {
        let guard = ConcurrencyGuard::new(LockMode::Pessimistic, false);
        let path = SavePath::root("Book");
        assert_eq!(
            guard
                .version_predicate(&versioned(), &Value::BigInt(1), None, &path)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_verify_update() {
        let path = SavePath::root("Book");
        let id = Value::BigInt(101);
        let version = Value::BigInt(9999);
        let err = ConcurrencyGuard::verify_update(&versioned(), &id, Some(&version), 0, &path)
            .unwrap_err();
        match err {
            SaveError::OptimisticLockViolation { id, version, .. } => {
                assert_eq!(id, Value::BigInt(101));
                assert_eq!(version, Value::BigInt(9999));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(ConcurrencyGuard::verify_update(&versioned(), &id, Some(&version), 1, &path).is_ok());
        assert!(ConcurrencyGuard::verify_update(&versioned(), &id, None, 0, &path).is_ok());
    }

    #[test]
    fn test_insert_version_defaults_to_zero() {
        assert_eq!(ConcurrencyGuard::insert_version(None), Value::BigInt(0));
        assert_eq!(
            ConcurrencyGuard::insert_version(Some(&Value::BigInt(4))),
            Value::BigInt(4)
        );
    }
}
