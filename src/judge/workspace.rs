/// Run-scoped workspace for compiled artifacts
///
/// Every compilation gets its own directory under the base directory, named
/// by a fresh UUID, so concurrent submissions never collide. The directory is
/// removed when the workspace is dropped.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct Workspace {
    run_id: String,
    run_dir: PathBuf,
}

impl Workspace {
    pub fn new(base_dir: &Path) -> io::Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let run_dir = base_dir.join(&run_id);
        fs::create_dir_all(&run_dir).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to create workspace directory {}: {}", run_dir.display(), e),
            )
        })?;
        Ok(Self { run_id, run_dir })
    }

    /// Workspace under the system temp directory.
    pub fn in_temp_dir() -> io::Result<Self> {
        Self::new(&std::env::temp_dir().join("limitbox"))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.run_dir
    }

    /// Path of `name` inside the workspace.
    pub fn file(&self, name: &str) -> PathBuf {
        self.run_dir.join(name)
    }

    pub fn write_file(&self, name: &str, content: &[u8]) -> io::Result<PathBuf> {
        let path = self.file(name);
        fs::write(&path, content).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to write {}: {}", path.display(), e),
            )
        })?;
        Ok(path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.run_dir) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to remove workspace {}: {}", self.run_dir.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspaces_are_isolated_and_removed() {
        let base = tempfile::tempdir().unwrap();
        let a = Workspace::new(base.path()).unwrap();
        let b = Workspace::new(base.path()).unwrap();
        assert_ne!(a.dir(), b.dir());
        let source = a.write_file("main.c", b"int main(){}").unwrap();
        assert!(source.starts_with(a.dir()));
        let dir = a.dir().to_path_buf();
        drop(a);
        assert!(!dir.exists());
        assert!(b.dir().exists());
    }
}
