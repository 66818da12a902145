/// Persisted view of the worker pool.
///
/// Two small JSON files under the state directory: `ports.json`
/// (`{"ports": [...]}`) and `runners.json` (`{"runners": [...]}`). They are
/// rewritten on every topology change and deleted on shutdown; their only
/// reader is the next supervisor, which uses them to find orphans.
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use goera_common::types::WorkerRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const PORTS_FILE: &str = "ports.json";
const RUNNERS_FILE: &str = "runners.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct PortsFile {
    ports: Vec<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunnersFile {
    runners: Vec<WorkerRecord>,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn runners_path(&self) -> PathBuf {
        self.dir.join(RUNNERS_FILE)
    }

    pub fn ports_path(&self) -> PathBuf {
        self.dir.join(PORTS_FILE)
    }

    pub fn save(&self, records: &[WorkerRecord]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state dir {}", self.dir.display()))?;

        let ports = PortsFile {
            ports: records.iter().map(|r| r.port).collect(),
        };
        let runners = RunnersFile {
            runners: records.to_vec(),
        };

        write_atomic(&self.ports_path(), &serde_json::to_vec_pretty(&ports)?)?;
        write_atomic(&self.runners_path(), &serde_json::to_vec_pretty(&runners)?)?;
        debug!(workers = records.len(), "Worker state persisted");
        Ok(())
    }

    /// Records left by a previous run; no file means no records
    pub fn load(&self) -> Result<Vec<WorkerRecord>> {
        let path = self.runners_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let file: RunnersFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(file.runners)
    }

    pub fn clear(&self) -> Result<()> {
        for path in [self.ports_path(), self.runners_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
                }
            }
        }
        // only succeeds when nothing else lives there
        let _ = fs::remove_dir(&self.dir);
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Deletes the persisted state when dropped, whatever path `main` leaves by
pub struct StateGuard {
    store: StateStore,
}

impl StateGuard {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear worker state: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use goera_common::types::WorkerState;

    fn record(port: u16, pid: u32) -> WorkerRecord {
        WorkerRecord {
            port,
            pid,
            state: WorkerState::Running,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));
        store.save(&[record(8081, 10), record(8082, 11)]).unwrap();

        let ports: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.ports_path()).unwrap()).unwrap();
        assert_eq!(ports["ports"], serde_json::json!([8081, 8082]));

        let runners: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.runners_path()).unwrap()).unwrap();
        assert_eq!(runners["runners"][1]["pid"], 11);
        assert_eq!(runners["runners"][0]["state"], "running");
        assert!(runners["runners"][0].get("startTime").is_some());
    }

    #[test]
    fn test_load_roundtrip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load().unwrap().is_empty());

        let saved = vec![record(9000, 42)];
        store.save(&saved).unwrap();
        assert_eq!(store.load().unwrap(), saved);
    }

    #[test]
    fn test_guard_clears_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let store = StateStore::new(&state_dir);
        store.save(&[record(8081, 1)]).unwrap();

        drop(StateGuard::new(store.clone()));

        assert!(!store.ports_path().exists());
        assert!(!store.runners_path().exists());
        assert!(!state_dir.exists());
    }
}
