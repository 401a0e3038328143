//! Core traits for records stored through the cache.

use serde::{de::DeserializeOwned, Serialize};

use super::keys::TableName;

/// A record kept in an id-keyed list under one table.
///
/// Lists are updated with append-or-replace-by-id semantics, so `id` must be
/// stable for the lifetime of the record.
pub trait ListRecord: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Table the list of these records is cached under
  const TABLE: TableName;

  /// Unique identifier within the table
  fn id(&self) -> &str;
}
