use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::engine::VirtualFs;

/// Virtual filesystem backed by one host directory. Names are flat: a leading `/` is
/// ignored and anything containing a path separator is refused.
#[derive(Debug, Clone)]
pub struct DirectoryFs {
    root: PathBuf,
}

impl DirectoryFs {
    /// # Errors
    /// Returns the I/O error from creating `root`.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path of a virtual file name.
    ///
    /// # Errors
    /// Returns `InvalidInput` for empty names and names that would leave the root.
    pub fn host_path(&self, name: &str) -> io::Result<PathBuf> {
        let name = name.strip_prefix('/').unwrap_or(name);
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid virtual file name: {name:?}"),
            ));
        }
        Ok(self.root.join(name))
    }
}

impl VirtualFs for DirectoryFs {
    fn write_file(&self, name: &str, contents: &[u8]) -> io::Result<()> {
        fs::write(self.host_path(name)?, contents)
    }

    fn read_file(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.host_path(name)?)
    }

    fn unlink(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.host_path(name)?)
    }

    fn exists(&self, name: &str) -> bool {
        self.host_path(name).is_ok_and(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_round_trip_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = DirectoryFs::new(dir.path().join("nested")).unwrap();
        vfs.write_file("/dbfile_1", b"abc").unwrap();
        assert!(vfs.exists("dbfile_1"));
        assert_eq!(vfs.read_file("dbfile_1").unwrap(), b"abc");
        vfs.unlink("dbfile_1").unwrap();
        assert!(!vfs.exists("dbfile_1"));
        assert_eq!(
            vfs.read_file("dbfile_1").unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn names_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = DirectoryFs::new(dir.path()).unwrap();
        assert!(vfs.host_path("../x").is_err());
        assert!(vfs.host_path("a/b").is_err());
        assert!(!vfs.exists(".."));
    }
}
