//! Logical tables and the namespaced keys they are stored under.
//!
//! Data lives at `cc_<user_<id>_>?<table>` and its metadata at
//! `ccmeta_<user_<id>_>?<table>`. The sync queue has its own reserved key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DATA_PREFIX: &str = "cc_";
pub const META_PREFIX: &str = "ccmeta_";
pub const SYNC_QUEUE_KEY: &str = "ccsys_sync_queue";

const USER_SCOPE: &str = "user_";

/// Logical record collections kept in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
  PrivacyRequests,
  PrivacyIncidents,
  Vendors,
  ConsentRecords,
  ComplianceStatus,
  FormDrafts,
  Preferences,
}

impl TableName {
  pub const ALL: [TableName; 7] = [
    TableName::PrivacyRequests,
    TableName::PrivacyIncidents,
    TableName::Vendors,
    TableName::ConsentRecords,
    TableName::ComplianceStatus,
    TableName::FormDrafts,
    TableName::Preferences,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::PrivacyRequests => "privacy_requests",
      Self::PrivacyIncidents => "privacy_incidents",
      Self::Vendors => "vendors",
      Self::ConsentRecords => "consent_records",
      Self::ComplianceStatus => "compliance_status",
      Self::FormDrafts => "form_drafts",
      Self::Preferences => "preferences",
    }
  }
}

impl fmt::Display for TableName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown table '{0}'")]
pub struct UnknownTable(pub String);

impl FromStr for TableName {
  type Err = UnknownTable;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|t| t.as_str() == s)
      .ok_or_else(|| UnknownTable(s.to_string()))
  }
}

fn scope(user_id: Option<&str>) -> String {
  match user_id {
    Some(id) => format!("{USER_SCOPE}{id}_"),
    None => String::new(),
  }
}

/// Key the serialized value of `table` is stored under.
pub fn data_key(table: TableName, user_id: Option<&str>) -> String {
  format!("{DATA_PREFIX}{}{}", scope(user_id), table.as_str())
}

/// Metadata key paired with a data key.
pub fn meta_key_for(data_key: &str) -> Option<String> {
  data_key
    .strip_prefix(DATA_PREFIX)
    .map(|rest| format!("{META_PREFIX}{rest}"))
}

/// Whether `key` is a data or metadata key in the given user's namespace.
///
/// Without a user id only unscoped keys match, so clearing the shared
/// namespace never touches per-user data.
pub fn in_namespace(key: &str, user_id: Option<&str>) -> bool {
  let rest = match key
    .strip_prefix(DATA_PREFIX)
    .or_else(|| key.strip_prefix(META_PREFIX))
  {
    Some(rest) => rest,
    None => return false,
  };

  let table = match user_id {
    Some(_) => match rest.strip_prefix(&scope(user_id)) {
      Some(table) => table,
      None => return false,
    },
    None => rest,
  };

  table.parse::<TableName>().is_ok()
}
