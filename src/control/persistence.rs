use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

const EXTENSION: &str = "xml";

/// A descriptor file found in the startup directory.
#[derive(Debug, Clone)]
pub struct PersistedDescriptor {
    pub path: PathBuf,
    pub contents: String,
}

/// One `<name>.xml` file per active plugin under the startup directory.
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    dir: PathBuf,
}

impl DescriptorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{EXTENSION}"))
    }

    pub async fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    /// Write through a temporary file so a crash never leaves a truncated descriptor.
    pub async fn save(&self, name: &str, xml: &str) -> io::Result<()> {
        let path = self.path_for(name);
        let staging = self.dir.join(format!(".{name}.{EXTENSION}.tmp"));
        fs::write(&staging, xml).await?;
        fs::rename(&staging, &path).await?;
        tracing::debug!(plugin = %name, path = %path.display(), "Descriptor persisted");
        Ok(())
    }

    /// Returns whether a file was removed.
    pub async fn remove(&self, name: &str) -> io::Result<bool> {
        match fs::remove_file(self.path_for(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, name: &str) -> bool {
        fs::try_exists(self.path_for(name)).await.unwrap_or(false)
    }

    /// Every descriptor in directory enumeration order. A missing directory is empty.
    pub async fn load_all(&self) -> io::Result<Vec<PersistedDescriptor>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut descriptors = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(contents) => descriptors.push(PersistedDescriptor { path, contents }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable descriptor");
                }
            }
        }
        Ok(descriptors)
    }
}
