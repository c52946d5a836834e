//! Index catalog model and naming conventions for rebuild leftovers.

use serde::{Deserialize, Serialize};

/// Prefix of replacement indexes built by the replacement strategy.
pub const REPLACEMENT_PREFIX: &str = "tmp_reindex_";

/// Prefix the original index briefly carries while names are swapped.
pub const OLD_PREFIX: &str = "old_reindex_";

/// Marker `REINDEX INDEX CONCURRENTLY` appends to the index it builds.
pub const NATIVE_LEFTOVER_MARKER: &str = "_ccnew";

/// An index as seen in the database catalog, with its bloat estimate.
///
/// Read-only: reindexing never mutates these values, it re-reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    /// Object id of the index.
    pub oid: u32,
    /// Schema of the index and its table.
    pub schema: String,
    /// Index name.
    pub name: String,
    /// Name of the indexed table.
    pub table: String,
    /// Definition as returned by `pg_get_indexdef`.
    pub definition: String,
    /// Enforces uniqueness.
    pub unique: bool,
    /// Usable by the planner.
    pub valid: bool,
    /// Partitioned index.
    pub partitioned: bool,
    /// Backs an exclusion constraint.
    pub exclusion: bool,
    /// Built over one or more expressions.
    pub expression: bool,
    /// Size on disk in bytes.
    pub ondisk_size_bytes: u64,
    /// Estimated bloat in bytes, if it could be estimated.
    #[serde(default)]
    pub bloat_size_bytes: Option<u64>,
}

impl Index {
    /// Schema-qualified name, `schema.name`.
    pub fn identifier(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Schema-qualified, quoted name for use in SQL.
    pub fn quoted_identifier(&self) -> String {
        qualified(&self.schema, &self.name)
    }

    /// Estimated bloat as a share of the on-disk size.
    pub fn relative_bloat(&self) -> f64 {
        match self.bloat_size_bytes {
            Some(bloat) if self.ondisk_size_bytes > 0 => {
                bloat as f64 / self.ondisk_size_bytes as f64
            }
            _ => 0.0,
        }
    }

    /// Name of the replacement index built for this one.
    pub fn replacement_name(&self) -> String {
        format!("{REPLACEMENT_PREFIX}{}", self.oid)
    }

    /// Name the original carries while names are swapped.
    pub fn old_name(&self) -> String {
        format!("{OLD_PREFIX}{}", self.oid)
    }

    /// Returns true for replacement or swap names of the replacement strategy.
    pub fn is_replacement_leftover(&self) -> bool {
        is_replacement_leftover(&self.name)
    }

    /// Returns true for `_ccnew` names left by an interrupted native rebuild.
    pub fn is_native_leftover(&self) -> bool {
        native_leftover_base(&self.name).is_some()
    }

    /// Returns true if `other` is a `_ccnew` leftover of this index.
    pub fn owns_native_leftover(&self, other: &Index) -> bool {
        other.schema == self.schema && native_leftover_base(&other.name) == Some(self.name.as_str())
    }
}

/// Returns true for names starting with a replacement strategy prefix.
pub fn is_replacement_leftover(name: &str) -> bool {
    name.starts_with(REPLACEMENT_PREFIX) || name.starts_with(OLD_PREFIX)
}

/// For `<base>_ccnew` or `<base>_ccnew<N>`, returns `<base>`.
fn native_leftover_base(name: &str) -> Option<&str> {
    let (base, suffix) = name.rsplit_once(NATIVE_LEFTOVER_MARKER)?;
    (!base.is_empty() && suffix.chars().all(|c| c.is_ascii_digit())).then_some(base)
}

/// Quotes an identifier for PostgreSQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes and schema-qualifies a relation name.
pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}
