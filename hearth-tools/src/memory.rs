//! The shared scratchpad file.

use std::path::PathBuf;

use tokio::sync::Mutex;

/// A single free-form text file the model may read and overwrite between
/// runs. Writes hold a single-writer lock; reads see the last committed
/// contents.
pub struct MemoryFile {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl MemoryFile {
    /// Wrap the scratchpad at `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// The scratchpad's location.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Current contents; empty if the file does not exist yet.
    pub async fn read(&self) -> std::io::Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Replace the contents.
    pub async fn write(&self, text: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let memory = MemoryFile::new(dir.path().join("memory.md"));
        assert_eq!(memory.read().await.unwrap(), "");
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let memory = MemoryFile::new(dir.path().join("memory.md"));
        memory.write("the porch light flickers").await.unwrap();
        assert_eq!(memory.read().await.unwrap(), "the porch light flickers");
        memory.write("replaced").await.unwrap();
        assert_eq!(memory.read().await.unwrap(), "replaced");
    }
}
