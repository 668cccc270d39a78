//! SQL identifier quoting and validation.
//!
//! Table and column names from the catalog are spliced into generated SQL,
//! so they are validated once when the catalog is built and quoted every
//! time they are rendered.

use crate::error::ConfigError;
use regex::Regex;
use std::sync::OnceLock;

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn identifier_regex() -> Result<&'static Regex, ConfigError> {
    static REGEX: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(IDENTIFIER_PATTERN))
        .as_ref()
        .map_err(|e| ConfigError::new(format!("identifier pattern failed to compile: {e}")))
}

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them (`"` → `""`).
///
/// # Examples
///
/// ```
/// use savegraph_core::quote_ident;
///
/// assert_eq!(quote_ident("book_store"), "\"book_store\"");
/// assert_eq!(quote_ident("user\"name"), "\"user\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Whether `name` is a plain identifier (letter or underscore, then
/// letters, digits and underscores).
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_ok_and(|re| re.is_match(name))
}

/// Check a catalog identifier, naming what it belongs to on failure.
pub fn validate_identifier(name: &str, what: &str) -> Result<(), ConfigError> {
    if identifier_regex()?.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::new(format!(
            "invalid {what} identifier '{name}'"
        )))
    }
}
