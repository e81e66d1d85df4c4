//! Durable storage for [`ScanState`].
//!
//! Saves never touch the canonical file directly: the JSON is written to a
//! sibling `.tmp` file, flushed and fsynced, checked for length, and only
//! then renamed over the canonical path. A crash at any point leaves either
//! the previous version or the new one on disk.
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::debug;

use super::{RawState, ScanState, STATE_VERSION};
use crate::error::{CorruptStateError, Error};

/// Location of a scan's state file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Stamps `last_updated` and atomically replaces the state file.
    pub fn save(&self, state: &mut ScanState) -> Result<(), Error> {
        state.metadata.last_updated = Utc::now();
        self.write_atomic(state).map_err(|source| Error::Persist {
            path: self.path.clone(),
            source,
        })
    }

    fn write_atomic(&self, state: &ScanState) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.temp_path();
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.flush()?;
            file.sync_all()?;

            let written = file.metadata()?.len();
            if written != bytes.len() as u64 {
                let _ = fs::remove_file(&tmp_path);
                return Err(io::Error::other(format!(
                    "short write to {}: {written} of {} bytes",
                    tmp_path.display(),
                    bytes.len()
                )));
            }
        }

        fs::rename(&tmp_path, &self.path)?;

        // Best effort: persist the rename itself.
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        debug!("Saved state to {} ({} bytes)", self.path.display(), bytes.len());
        Ok(())
    }

    /// Reads and validates the state file.
    ///
    /// Missing, empty, unparsable, version-mismatched or internally
    /// inconsistent files are all reported as [`CorruptStateError`]. Whether
    /// that means "start fresh" or "abort" is up to the caller.
    pub fn load(&self) -> Result<ScanState, CorruptStateError> {
        let path = &self.path;
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CorruptStateError::Missing(path.clone()))
            }
            Err(source) => {
                return Err(CorruptStateError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };

        if content.trim().is_empty() {
            return Err(CorruptStateError::Empty(path.clone()));
        }

        let raw: RawState =
            serde_json::from_str(&content).map_err(|source| CorruptStateError::Malformed {
                path: path.clone(),
                source,
            })?;

        if raw.version() != STATE_VERSION {
            return Err(CorruptStateError::VersionMismatch {
                path: path.clone(),
                found: raw.version().to_owned(),
                expected: STATE_VERSION,
            });
        }

        raw.into_state()
            .map_err(|(key, target)| CorruptStateError::Inconsistent {
                path: path.clone(),
                key,
                target,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::StateStore;
    use crate::error::CorruptStateError;
    use crate::state::{ScanState, Stage, VulnStatus};
    use std::fs;
    use std::path::Path;

    fn sample_state() -> ScanState {
        let mut state = ScanState::new(["10.0.0.0/24", "10.0.0.1", "10.0.1.0/24"], Path::new("out"));
        {
            let unit = state.get_mut("10.0.0.0/24").unwrap();
            unit.transition(Stage::HostDiscovery).unwrap();
            unit.add_live_hosts(["10.0.0.5".to_owned(), "10.0.0.1".to_owned()]);
            unit.transition(Stage::PortDiscoveryComplete).unwrap();
            unit.set_open_ports(vec![443, 22]);
            unit.target_urls = vec!["10.0.0.5:22".to_owned(), "10.0.0.5:443".to_owned()];
            unit.vuln_status = Some(VulnStatus::Complete);
        }
        state.get_mut("10.0.0.1").unwrap().fail("port discovery failed: exit code 1").unwrap();
        state
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("targets_state.json"));
        let mut state = sample_state();

        store.save(&mut state).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded, state);
        assert_eq!(
            loaded.keys().collect::<Vec<_>>(),
            ["10.0.0.0/24", "10.0.0.1", "10.0.1.0/24"]
        );
    }

    #[test]
    fn save_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&mut sample_state()).unwrap();

        assert!(store.exists());
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested/deeper/state.json"));
        store.save(&mut sample_state()).unwrap();
        assert!(store.load().is_ok());
    }

    #[test]
    fn interrupted_write_keeps_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);
        let mut state = sample_state();
        store.save(&mut state).unwrap();

        // A crash mid-save leaves a partial side file and the old canonical file.
        let full = fs::read_to_string(&path).unwrap();
        fs::write(dir.path().join("state.json.tmp"), &full[..full.len() / 2]).unwrap();

        assert_eq!(store.load().unwrap(), state);

        // The next save simply replaces the stale side file.
        state.get_mut("10.0.1.0/24").unwrap().transition(Stage::HostDiscovery).unwrap();
        store.save(&mut state).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn missing_file_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("absent.json"));
        assert!(matches!(store.load(), Err(CorruptStateError::Missing(_))));
    }

    #[test]
    fn empty_file_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "  \n").unwrap();
        assert!(matches!(
            StateStore::new(&path).load(),
            Err(CorruptStateError::Empty(_))
        ));
    }

    #[test]
    fn truncated_file_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"metadata": {"created_at": "2024-01-01T00:00:00Z""#).unwrap();
        assert!(matches!(
            StateStore::new(&path).load(),
            Err(CorruptStateError::Malformed { .. })
        ));
    }

    #[test]
    fn unknown_stage_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{
                "metadata": {"created_at": "2024-01-01T00:00:00Z", "last_updated": "2024-01-01T00:00:00Z", "version": "1.0"},
                "targets": {"10.0.0.1": {"target": "10.0.0.1", "stage": "warming_up", "directory": "o/10_0_0_1",
                    "started_at": null, "completed_at": null, "error": null}}
            }"#,
        )
        .unwrap();
        assert!(matches!(
            StateStore::new(&path).load(),
            Err(CorruptStateError::Malformed { .. })
        ));
    }

    #[test]
    fn version_mismatch_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{"metadata": {"created_at": "2024-01-01T00:00:00Z", "last_updated": "2024-01-01T00:00:00Z", "version": "0.9"}, "targets": {}}"#,
        )
        .unwrap();

        match StateStore::new(&path).load() {
            Err(CorruptStateError::VersionMismatch { found, .. }) => assert_eq!(found, "0.9"),
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[test]
    fn key_target_disagreement_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{
                "metadata": {"created_at": "2024-01-01T00:00:00Z", "last_updated": "2024-01-01T00:00:00Z", "version": "1.0"},
                "targets": {"10.0.0.1": {"target": "10.0.0.2", "stage": "pending", "directory": "o/10_0_0_2",
                    "started_at": null, "completed_at": null, "error": null}}
            }"#,
        )
        .unwrap();
        assert!(matches!(
            StateStore::new(&path).load(),
            Err(CorruptStateError::Inconsistent { .. })
        ));
    }

    #[test]
    fn queued_flags_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut state = sample_state();
        state.get_mut("10.0.1.0/24").unwrap().queued_nmap = true;
        store.save(&mut state).unwrap();

        let loaded = store.load().unwrap();
        assert!(!loaded.get("10.0.1.0/24").unwrap().queued_nmap);
    }
}
