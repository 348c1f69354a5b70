//! Feature list persistence
//!
//! The feature file is shared with external collaborators (the dashboard,
//! the initialization wizard, the agents themselves through the preserved
//! file list), so every read and write happens under the cross-process
//! [`FileLock`] and the file's original shape is preserved on write.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::lock::FileLock;
use crate::{Error, Result};

/// Lifecycle status of a feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Open,
    Verifying,
    Passed,
    Failed,
}

/// Classification of a terminal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Infrastructure problem outside the feature itself
    Environment,
    /// Only tests or verification failed; the implementation may be fine
    TestOnly,
    /// The implementation itself failed
    Implementation,
    /// Verification never passed after merge
    Verification,
    Unknown,
}

/// One feature specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    /// Positive, unique
    pub id: u64,
    /// Free-form routing key
    pub category: String,
    pub name: String,
    pub description: String,
    /// Ordered acceptance steps verified one by one
    #[serde(default)]
    pub steps: Vec<String>,
    pub status: FeatureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}

/// Shape the feature file was read in; writes preserve it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileForm {
    /// `[ Feature, ... ]`
    Bare,
    /// `{ "features": [ Feature, ... ] }`
    Wrapped,
}

#[derive(Serialize, Deserialize)]
struct WrappedFile {
    features: Vec<Feature>,
}

/// Feature list store over a single JSON file
#[derive(Debug, Clone)]
pub struct FeatureStore {
    path: PathBuf,
}

impl FeatureStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "features.json".to_string());
        name.push_str(".lock");
        self.path.with_file_name(name)
    }

    /// Load the complete feature list
    pub fn load_features(&self) -> Result<Vec<Feature>> {
        let _lock = FileLock::acquire(self.lock_path())?;
        let (features, _) = self.read()?;
        Ok(features)
    }

    /// Load a single feature by id
    pub fn get_feature(&self, id: u64) -> Result<Option<Feature>> {
        Ok(self.load_features()?.into_iter().find(|f| f.id == id))
    }

    /// Set a feature's status
    ///
    /// Failure fields are cleared when the status becomes `passed` or `open`
    /// and set when it becomes `failed`; `progress` overwrites only when
    /// provided.
    pub fn update_feature_status(
        &self,
        id: u64,
        status: FeatureStatus,
        failure_reason: Option<&str>,
        failure_kind: Option<FailureKind>,
        progress: Option<&str>,
    ) -> Result<Feature> {
        let _lock = FileLock::acquire(self.lock_path())?;
        let (mut features, form) = self.read()?;

        let feature = features
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or(Error::FeatureNotFound(id))?;

        feature.status = status;
        match status {
            FeatureStatus::Passed | FeatureStatus::Open => {
                feature.failure_reason = None;
                feature.failure_kind = None;
            }
            FeatureStatus::Failed => {
                feature.failure_reason = failure_reason.map(str::to_string);
                feature.failure_kind = failure_kind;
            }
            FeatureStatus::Verifying => {}
        }
        if let Some(p) = progress {
            feature.progress = Some(p.to_string());
        }

        let updated = feature.clone();
        self.write(&features, form)?;
        Ok(updated)
    }

    fn read(&self) -> Result<(Vec<Feature>, FileForm)> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Config(format!(
                "cannot read feature file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let value: serde_json::Value = serde_json::from_str(&contents).map_err(|e| {
            Error::Config(format!(
                "feature file {} is not valid JSON: {}",
                self.path.display(),
                e
            ))
        })?;

        if value.is_array() {
            let features: Vec<Feature> = serde_json::from_value(value)?;
            Ok((features, FileForm::Bare))
        } else {
            let wrapped: WrappedFile = serde_json::from_value(value).map_err(|e| {
                Error::Config(format!(
                    "feature file {} has neither a bare array nor a `features` array: {}",
                    self.path.display(),
                    e
                ))
            })?;
            Ok((wrapped.features, FileForm::Wrapped))
        }
    }

    fn write(&self, features: &[Feature], form: FileForm) -> Result<()> {
        let json = match form {
            FileForm::Bare => serde_json::to_string_pretty(features)?,
            FileForm::Wrapped => serde_json::to_string_pretty(&WrappedFile {
                features: features.to_vec(),
            })?,
        };

        // Write-then-rename so readers never observe a half-written file
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, format!("{}\n", json))?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(id: u64, category: &str) -> Feature {
        Feature {
            id,
            category: category.to_string(),
            name: format!("Feature {}", id),
            description: "does something".to_string(),
            steps: vec!["step one".to_string()],
            status: FeatureStatus::Open,
            failure_reason: None,
            failure_kind: None,
            progress: None,
        }
    }

    fn store_with(features: &[Feature], wrapped: bool) -> (tempfile::TempDir, FeatureStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.json");
        let json = if wrapped {
            serde_json::to_string_pretty(&serde_json::json!({ "features": features })).unwrap()
        } else {
            serde_json::to_string_pretty(features).unwrap()
        };
        std::fs::write(&path, format!("{}\n", json)).unwrap();
        (dir, FeatureStore::new(path))
    }

    #[test]
    fn test_load_bare_form() {
        let (_dir, store) = store_with(&[feature(1, "core"), feature(2, "ui")], false);
        let features = store.load_features().unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].id, 1);
    }

    #[test]
    fn test_load_wrapped_form() {
        let (_dir, store) = store_with(&[feature(1, "core")], true);
        let features = store.load_features().unwrap();
        assert_eq!(features.len(), 1);
    }

    #[test]
    fn test_form_preserved_on_write() {
        let (_dir, store) = store_with(&[feature(1, "core")], true);
        store
            .update_feature_status(1, FeatureStatus::Passed, None, None, None)
            .unwrap();

        let contents = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert!(value.get("features").is_some());

        let (_dir, store) = store_with(&[feature(1, "core")], false);
        store
            .update_feature_status(1, FeatureStatus::Passed, None, None, None)
            .unwrap();
        let contents = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn test_failed_sets_and_passed_clears() {
        let (_dir, store) = store_with(&[feature(3, "core")], false);

        let updated = store
            .update_feature_status(
                3,
                FeatureStatus::Failed,
                Some("tests did not pass"),
                Some(FailureKind::TestOnly),
                None,
            )
            .unwrap();
        assert_eq!(updated.failure_reason.as_deref(), Some("tests did not pass"));
        assert_eq!(updated.failure_kind, Some(FailureKind::TestOnly));

        let updated = store
            .update_feature_status(3, FeatureStatus::Passed, None, None, Some("all steps pass"))
            .unwrap();
        assert!(updated.failure_reason.is_none());
        assert!(updated.failure_kind.is_none());
        assert_eq!(updated.progress.as_deref(), Some("all steps pass"));
    }

    #[test]
    fn test_progress_survives_unrelated_update() {
        let (_dir, store) = store_with(&[feature(3, "core")], false);
        store
            .update_feature_status(3, FeatureStatus::Verifying, None, None, Some("merged"))
            .unwrap();
        let updated = store
            .update_feature_status(3, FeatureStatus::Failed, Some("boom"), None, None)
            .unwrap();
        assert_eq!(updated.progress.as_deref(), Some("merged"));
    }

    #[test]
    fn test_missing_feature() {
        let (_dir, store) = store_with(&[feature(1, "core")], false);
        let err = store
            .update_feature_status(99, FeatureStatus::Passed, None, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::FeatureNotFound(99)));
    }

    #[test]
    fn test_update_is_idempotent_on_disk() {
        let (_dir, store) = store_with(&[feature(1, "core"), feature(2, "ui")], true);

        store
            .update_feature_status(1, FeatureStatus::Passed, None, None, None)
            .unwrap();
        let first = std::fs::read(store.path()).unwrap();

        store
            .update_feature_status(1, FeatureStatus::Passed, None, None, None)
            .unwrap();
        let second = std::fs::read(store.path()).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_read_write_round_trip_is_byte_identical() {
        let (_dir, store) = store_with(&[feature(1, "core")], false);
        let before = std::fs::read(store.path()).unwrap();

        // Status already open; the update rewrites without changing content
        store
            .update_feature_status(1, FeatureStatus::Open, None, None, None)
            .unwrap();
        let after = std::fs::read(store.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.json");
        std::fs::write(&path, "not json").unwrap();
        let store = FeatureStore::new(path);
        assert!(matches!(
            store.load_features().unwrap_err(),
            Error::Config(_)
        ));
    }
}
