//! Notebook ingestion: scanning, hashing, and change watching.
//!
//! The notebook is a directory with `automations/*.md`, `cues/*.md`, and
//! `memory.md`. An automation's identity is the SHA-256 of its contents,
//! so renames keep their schedules and edits schedule fresh.

use std::path::{Path, PathBuf};

use notify::Watcher as _;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::RuntimeError;

/// One automation (or cue) file, snapshotted.
#[derive(Debug, Clone, PartialEq)]
pub struct Automation {
    /// SHA-256 of `contents`, hex-encoded. The primary identity.
    pub hash: String,
    /// File name relative to its subtree, e.g. `morning-coffee.md`.
    pub file_name: String,
    /// Full file contents; the prompt.
    pub contents: String,
}

/// Hash automation contents the way the store keys them.
pub fn content_hash(contents: &str) -> String {
    let digest = Sha256::digest(contents.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// A full scan of the notebook.
#[derive(Debug, Clone, Default)]
pub struct NotebookScan {
    /// Files under `automations/`.
    pub automations: Vec<Automation>,
    /// Files under `cues/`.
    pub cues: Vec<Automation>,
}

/// The scratchpad path within a notebook.
pub fn memory_path(notebook: &Path) -> PathBuf {
    notebook.join("memory.md")
}

/// Scan the notebook directory.
///
/// Missing subtrees scan as empty; a brand-new notebook is valid.
pub fn scan(notebook: &Path) -> Result<NotebookScan, RuntimeError> {
    Ok(NotebookScan {
        automations: scan_subtree(&notebook.join("automations"))?,
        cues: scan_subtree(&notebook.join("cues"))?,
    })
}

fn scan_subtree(dir: &Path) -> Result<Vec<Automation>, RuntimeError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(RuntimeError::Notebook(format!(
                "cannot read {}: {e}",
                dir.display()
            )))
        }
    };

    let mut automations = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RuntimeError::Notebook(e.to_string()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            RuntimeError::Notebook(format!("cannot read {}: {e}", path.display()))
        })?;
        automations.push(Automation {
            hash: content_hash(&contents),
            file_name,
            contents,
        });
    }
    automations.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(automations)
}

/// A change seen by the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotebookEvent {
    /// Files inside the notebook changed; rescan and reconcile.
    Changed,
    /// The notebook directory itself moved or was replaced; callers
    /// should tear down and boot again.
    Restart,
}

/// Watches the notebook directory for changes.
///
/// The watcher thread pushes into a channel; bursts beyond the buffer
/// are dropped, which is harmless because any one event forces a full
/// rescan.
pub struct NotebookWatcher {
    _watcher: notify::RecommendedWatcher,
    /// Change events, coalesced by the receiver.
    pub events: mpsc::Receiver<NotebookEvent>,
}

/// Start watching `notebook`.
pub fn watch(notebook: &Path) -> Result<NotebookWatcher, RuntimeError> {
    let (tx, rx) = mpsc::channel(16);
    let root = notebook.to_path_buf();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "notebook watch error");
                return;
            }
        };
        let touches_root = event.paths.iter().any(|p| p == &root);
        let kind = if touches_root {
            NotebookEvent::Restart
        } else {
            NotebookEvent::Changed
        };
        let _ = tx.try_send(kind);
    })
    .map_err(|e| RuntimeError::Notebook(format!("cannot create watcher: {e}")))?;

    watcher
        .watch(notebook, notify::RecursiveMode::Recursive)
        .map_err(|e| RuntimeError::Notebook(format!("cannot watch {}: {e}", notebook.display())))?;

    Ok(NotebookWatcher {
        _watcher: watcher,
        events: rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(notebook: &Path, rel: &str, contents: &str) {
        let path = notebook.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn hash_is_stable_and_content_addressed() {
        let a = content_hash("turn on the porch light at dusk");
        let b = content_hash("turn on the porch light at dusk");
        let c = content_hash("turn on the porch light at dawn");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn scan_reads_both_subtrees_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "automations/b-evening.md", "dim lights at 9pm");
        write(dir.path(), "automations/a-morning.md", "coffee at 7am");
        write(dir.path(), "cues/party.md", "party mode");
        write(dir.path(), "automations/notes.txt", "not an automation");

        let scan = scan(dir.path()).unwrap();
        assert_eq!(scan.automations.len(), 2);
        assert_eq!(scan.automations[0].file_name, "a-morning.md");
        assert_eq!(scan.automations[1].file_name, "b-evening.md");
        assert_eq!(scan.cues.len(), 1);
        assert_eq!(scan.cues[0].contents, "party mode");
    }

    #[test]
    fn missing_notebook_scans_empty() {
        let dir = tempfile::tempdir().unwrap();
        let scan = scan(&dir.path().join("nope")).unwrap();
        assert!(scan.automations.is_empty());
        assert!(scan.cues.is_empty());
    }

    #[test]
    fn rename_keeps_hash() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "automations/old-name.md", "same contents");
        let first = scan(dir.path()).unwrap();

        std::fs::rename(
            dir.path().join("automations/old-name.md"),
            dir.path().join("automations/new-name.md"),
        )
        .unwrap();
        let second = scan(dir.path()).unwrap();

        assert_eq!(first.automations[0].hash, second.automations[0].hash);
        assert_ne!(first.automations[0].file_name, second.automations[0].file_name);
    }

    #[tokio::test]
    async fn watcher_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "automations/a.md", "v1");
        let mut watcher = watch(dir.path()).unwrap();

        write(dir.path(), "automations/a.md", "v2");

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), watcher.events.recv())
            .await
            .expect("watcher should report the write")
            .unwrap();
        assert_eq!(event, NotebookEvent::Changed);
    }
}
