//! One-time upgrade of legacy flat storage keys into the typed cache.
//!
//! Older releases stored each record under its own key, for example
//! `privacy_incident_abc`. Migration reads those keys, classifies them by
//! prefix, and saves the records through [`CacheManager`] with
//! append-or-replace-by-id semantics, so a re-run never duplicates records.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::cache::CacheManager;
use crate::records::{Preferences, Record};
use crate::store::entry_size;

pub const MIGRATION_STATUS_KEY: &str = "privacy_migration_status";
pub const TARGET_VERSION: &str = "2.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegacyKind {
  Request,
  Incident,
  Vendor,
  Consent,
  Compliance,
  Form,
  Preference,
}

const LEGACY_PREFIXES: [(&str, LegacyKind); 7] = [
  ("privacy_request_", LegacyKind::Request),
  ("privacy_incident_", LegacyKind::Incident),
  ("vendor_", LegacyKind::Vendor),
  ("consent_", LegacyKind::Consent),
  ("compliance_", LegacyKind::Compliance),
  ("form_", LegacyKind::Form),
  ("preference_", LegacyKind::Preference),
];

/// Split a legacy key into its kind and the suffix after the prefix.
fn classify(key: &str) -> Option<(LegacyKind, &str)> {
  LEGACY_PREFIXES.iter().find_map(|(prefix, kind)| {
    key
      .strip_prefix(prefix)
      .filter(|suffix| !suffix.is_empty())
      .map(|suffix| (*kind, suffix))
  })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
  NotStarted,
  InProgress,
  Complete,
}

/// Persisted migration marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationStatus {
  pub completed: bool,
  pub last_migration: Option<DateTime<Utc>>,
  pub version: String,
  pub errors: Vec<String>,
}

impl MigrationStatus {
  /// Whether a completed migration to `target_version` is on record.
  pub fn is_current(&self, target_version: &str) -> bool {
    self.completed && self.version == target_version
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
  pub success: bool,
  pub errors: Vec<String>,
  /// Records saved into the new schema
  pub migrated: usize,
}

impl MigrationReport {
  fn already_done() -> Self {
    Self {
      success: true,
      errors: Vec::new(),
      migrated: 0,
    }
  }
}

/// Summary for the migration banner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationInfo {
  pub needs_migration: bool,
  pub current_version: Option<String>,
  pub target_version: String,
  /// Bytes held by legacy keys
  pub estimated_data_size: usize,
}

pub struct MigrationService {
  cache: CacheManager,
  user_id: Option<String>,
  target_version: String,
  state: Mutex<MigrationState>,
}

impl MigrationService {
  /// Migrate legacy data into the namespace of `user_id`.
  pub fn new(cache: CacheManager, user_id: Option<String>) -> Self {
    Self {
      cache,
      user_id,
      target_version: TARGET_VERSION.to_string(),
      state: Mutex::new(MigrationState::NotStarted),
    }
  }

  /// Progress of this service's own runs.
  pub fn state(&self) -> MigrationState {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_state(&self, state: MigrationState) {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
  }

  /// Read the stored status, or an empty one if none is stored or readable.
  pub fn check_migration_status(&self) -> MigrationStatus {
    match self.cache.store().get_item(MIGRATION_STATUS_KEY) {
      Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(error = %e, "unreadable migration status, treating as not migrated");
        MigrationStatus::default()
      }),
      Ok(None) => MigrationStatus::default(),
      Err(e) => {
        warn!(error = %e, "failed to read migration status");
        MigrationStatus::default()
      }
    }
  }

  fn write_status(&self, status: &MigrationStatus) -> Result<()> {
    let raw = serde_json::to_string(status)?;
    self
      .cache
      .store()
      .set_item(MIGRATION_STATUS_KEY, &raw)
      .map_err(|e| eyre!("Failed to store migration status: {}", e))
  }

  /// Record a completed migration to the target version.
  pub fn mark_migration_complete(&self) -> Result<()> {
    self.write_status(&MigrationStatus {
      completed: true,
      last_migration: Some(self.cache.now()),
      version: self.target_version.clone(),
      errors: Vec::new(),
    })?;
    self.set_state(MigrationState::Complete);
    Ok(())
  }

  /// Explicit (re)run, as triggered from the migration banner.
  pub async fn start_migration(&self) -> MigrationReport {
    self.migrate_data_to_new_schema().await
  }

  /// Move legacy keys into the typed cache.
  ///
  /// A no-op once the stored status matches the target version. Failures are
  /// isolated per key and collected in the report; migration is only marked
  /// complete when every key went through.
  pub async fn migrate_data_to_new_schema(&self) -> MigrationReport {
    let status = self.check_migration_status();
    if status.is_current(&self.target_version) {
      self.set_state(MigrationState::Complete);
      return MigrationReport::already_done();
    }

    {
      let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
      if *state == MigrationState::InProgress {
        return MigrationReport {
          success: false,
          errors: vec!["migration already in progress".to_string()],
          migrated: 0,
        };
      }
      *state = MigrationState::InProgress;
    }

    let keys = match self.cache.store().keys() {
      Ok(keys) => keys,
      Err(e) => {
        self.set_state(MigrationState::NotStarted);
        return MigrationReport {
          success: false,
          errors: vec![format!("failed to list stored keys: {}", e)],
          migrated: 0,
        };
      }
    };

    info!(target_version = %self.target_version, "starting data migration");
    let mut errors = Vec::new();
    let mut migrated = 0;

    for key in keys {
      let Some((kind, suffix)) = classify(&key) else {
        continue;
      };
      match self.migrate_key(&key, kind, suffix).await {
        Ok(count) => {
          debug!(%key, count, "migrated legacy key");
          migrated += count;
        }
        Err(e) => {
          warn!(%key, error = %e, "skipping legacy key");
          errors.push(format!("{}: {:#}", key, e));
        }
      }
    }

    let finished = if errors.is_empty() {
      self.mark_migration_complete()
    } else {
      self.write_status(&MigrationStatus {
        completed: false,
        last_migration: Some(self.cache.now()),
        version: status.version,
        errors: errors.clone(),
      })
    };

    if let Err(e) = finished {
      errors.push(format!("{:#}", e));
    }

    let success = errors.is_empty();
    self.set_state(if success {
      MigrationState::Complete
    } else {
      MigrationState::NotStarted
    });
    info!(migrated, failed = errors.len(), "data migration finished");

    MigrationReport {
      success,
      errors,
      migrated,
    }
  }

  async fn migrate_key(&self, key: &str, kind: LegacyKind, suffix: &str) -> Result<usize> {
    let raw = match self.cache.store().get_item(key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return Ok(0),
      Err(e) => return Err(eyre!("failed to read: {}", e)),
    };
    let value: Value = serde_json::from_str(&raw).map_err(|e| eyre!("invalid JSON: {}", e))?;

    if kind == LegacyKind::Preference {
      self.migrate_preference(suffix, value).await?;
      return Ok(1);
    }

    let objects = match value {
      Value::Array(items) => {
        let many = items.len() > 1;
        items
          .into_iter()
          .enumerate()
          .map(|(index, item)| {
            let fallback_id = if many {
              format!("{}-{}", suffix, index)
            } else {
              suffix.to_string()
            };
            with_id(item, &fallback_id)
          })
          .collect::<Result<Vec<_>>>()?
      }
      object @ Value::Object(_) => vec![with_id(object, suffix)?],
      other => return Err(eyre!("expected an object or array, found {}", other)),
    };

    let user_id = self.user_id.as_deref();
    let mut saved = 0;
    for object in objects {
      let record = to_record(kind, object)?;
      let table = record.table();
      if self.cache.save_record(record, user_id).await.is_dropped() {
        return Err(eyre!(
          "failed to store record in {} after {} saved, see log",
          table,
          saved
        ));
      }
      saved += 1;
    }
    Ok(saved)
  }

  /// Merge a legacy preference key into the single preferences object.
  async fn migrate_preference(&self, suffix: &str, value: Value) -> Result<()> {
    let user_id = self.user_id.as_deref();
    let current = self.cache.preferences(user_id).await;
    let mut merged = match serde_json::to_value(&current)? {
      Value::Object(map) => map,
      _ => Map::new(),
    };

    match value {
      Value::Object(fields) => merged.extend(fields),
      scalar => {
        merged.insert(camel_case(suffix), scalar);
      }
    }

    let prefs: Preferences = serde_json::from_value(Value::Object(merged))
      .map_err(|e| eyre!("invalid preference value: {}", e))?;
    if self.cache.save_preferences(&prefs, user_id).await.is_dropped() {
      return Err(eyre!("failed to store preferences, see log"));
    }
    Ok(())
  }

  /// Delete every legacy key. Meant to run only after the user confirmed a
  /// successful migration. Returns the number of keys removed.
  pub fn cleanup_old_data(&self) -> Result<usize> {
    let store = self.cache.store();
    let keys = store
      .keys()
      .map_err(|e| eyre!("Failed to list stored keys: {}", e))?;

    let mut removed = 0;
    for key in keys.iter().filter(|key| classify(key).is_some()) {
      store
        .remove_item(key)
        .map_err(|e| eyre!("Failed to remove {}: {}", key, e))?;
      removed += 1;
    }

    info!(removed, "removed legacy data");
    Ok(removed)
  }

  /// Whether a migration is due and how much legacy data it would move.
  pub fn migration_info(&self) -> MigrationInfo {
    let status = self.check_migration_status();
    let store = self.cache.store();

    let estimated_data_size = store
      .keys()
      .unwrap_or_default()
      .into_iter()
      .filter(|key| classify(key).is_some())
      .filter_map(|key| {
        let value = store.get_item(&key).ok().flatten()?;
        Some(entry_size(&key, &value))
      })
      .sum();

    MigrationInfo {
      needs_migration: !status.is_current(&self.target_version) && estimated_data_size > 0,
      current_version: Some(status.version).filter(|v| !v.is_empty()),
      target_version: self.target_version.clone(),
      estimated_data_size,
    }
  }
}

/// Ensure a legacy object carries an id, taking `fallback` when it has none.
fn with_id(value: Value, fallback: &str) -> Result<Value> {
  let mut map = match value {
    Value::Object(map) => map,
    other => return Err(eyre!("expected an object, found {}", other)),
  };

  let id = match map.remove("id") {
    Some(Value::String(id)) if !id.is_empty() => id,
    // Older releases used numeric ids
    Some(Value::Number(n)) => n.to_string(),
    _ => fallback.to_string(),
  };
  map.insert("id".to_string(), Value::String(id));

  Ok(Value::Object(map))
}

fn to_record(kind: LegacyKind, object: Value) -> Result<Record> {
  let record = match kind {
    LegacyKind::Request => Record::Request(serde_json::from_value(object)?),
    LegacyKind::Incident => Record::Incident(serde_json::from_value(object)?),
    LegacyKind::Vendor => Record::Vendor(serde_json::from_value(object)?),
    LegacyKind::Consent => Record::Consent(serde_json::from_value(object)?),
    LegacyKind::Compliance => Record::Compliance(serde_json::from_value(object)?),
    LegacyKind::Form => Record::Form(serde_json::from_value(object)?),
    LegacyKind::Preference => Record::Preferences(serde_json::from_value(object)?),
  };
  Ok(record)
}

/// `email_notifications` -> `emailNotifications`
fn camel_case(name: &str) -> String {
  let mut out = String::with_capacity(name.len());
  let mut upper = false;
  for c in name.chars() {
    if c == '_' {
      upper = true;
    } else if upper {
      out.extend(c.to_uppercase());
      upper = false;
    } else {
      out.push(c);
    }
  }
  out
}
