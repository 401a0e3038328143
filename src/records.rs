//! Business record kinds that flow through the cache.
//!
//! The application's schemas are owned elsewhere; these types pin down only
//! the fields the cache and migration rely on and keep everything else in
//! `extra`, so unknown fields survive a round-trip untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::{ListRecord, TableName};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyRequest {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub request_type: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub due_date: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyIncident {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub severity: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vendor {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub risk_level: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecord {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub subject_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub purpose: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub granted: Option<bool>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceItem {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub framework: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Saved, partially completed assessment form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormDraft {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub form_type: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Per-user UI preferences, stored as a single object rather than a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub theme: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub language: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notifications: Option<bool>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Default for Preferences {
  fn default() -> Self {
    Self {
      theme: Some("light".to_string()),
      language: Some("en".to_string()),
      notifications: Some(true),
      extra: Map::new(),
    }
  }
}

macro_rules! list_record {
  ($ty:ty, $table:expr) => {
    impl ListRecord for $ty {
      const TABLE: TableName = $table;

      fn id(&self) -> &str {
        &self.id
      }
    }
  };
}

list_record!(PrivacyRequest, TableName::PrivacyRequests);
list_record!(PrivacyIncident, TableName::PrivacyIncidents);
list_record!(Vendor, TableName::Vendors);
list_record!(ConsentRecord, TableName::ConsentRecords);
list_record!(ComplianceItem, TableName::ComplianceStatus);
list_record!(FormDraft, TableName::FormDrafts);

/// Any single business record, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
  Request(PrivacyRequest),
  Incident(PrivacyIncident),
  Vendor(Vendor),
  Consent(ConsentRecord),
  Compliance(ComplianceItem),
  Form(FormDraft),
  Preferences(Preferences),
}

impl Record {
  pub fn table(&self) -> TableName {
    match self {
      Self::Request(_) => TableName::PrivacyRequests,
      Self::Incident(_) => TableName::PrivacyIncidents,
      Self::Vendor(_) => TableName::Vendors,
      Self::Consent(_) => TableName::ConsentRecords,
      Self::Compliance(_) => TableName::ComplianceStatus,
      Self::Form(_) => TableName::FormDrafts,
      Self::Preferences(_) => TableName::Preferences,
    }
  }
}
