//! Directories on a locally mounted filesystem.

use super::error::{ModelError, Result};
use super::handle::Handle;
use super::manager::{Cookie, SourceManager};
use super::resource::{ContentStream, LocalPath, Resource};
use super::source::{HandleIter, Source, SourceDriver};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilesystemSource {
    pub path: PathBuf,
}

impl FilesystemSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Resolves a handle's path below the root. Paths that would end up
    /// outside it, directly or through a symlink, name nothing.
    fn full_path(&self, relative: &str) -> Result<PathBuf> {
        let outside = || ModelError::not_found(format!("{relative} is outside {}", self.path.display()));
        let relative = Path::new(relative);
        if relative.as_os_str().is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(outside());
        }

        let path = self.path.join(relative);
        if let (Ok(real), Ok(root)) = (fs::canonicalize(&path), fs::canonicalize(&self.path)) {
            if !real.starts_with(&root) {
                return Err(outside());
            }
        }
        Ok(path)
    }
}

/// Canonical root directory, checked when the session was opened.
struct FsCookie {
    root: PathBuf,
}

impl SourceDriver for FilesystemSource {
    fn open(&self, _sm: &SourceManager) -> Result<Cookie> {
        let root = fs::canonicalize(&self.path)
            .map_err(|e| ModelError::unavailable(format!("{}: {e}", self.path.display())))?;
        if !root.is_dir() {
            return Err(ModelError::unavailable(format!(
                "{} is not a directory",
                self.path.display()
            )));
        }
        Ok(Arc::new(FsCookie { root }))
    }

    fn handles(&self, this: &Arc<Source>, cookie: Cookie) -> Result<HandleIter> {
        let root = cookie
            .downcast::<FsCookie>()
            .map_err(|_| ModelError::CookieType("file"))?
            .root
            .clone();
        let source = Arc::clone(this);

        let iter = WalkDir::new(&root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    Some(Ok(Handle::new(Arc::clone(&source), relative(&root, entry.path()))))
                }
                Ok(_) => None,
                Err(err) => Some(Err(ModelError::Io(io::Error::other(err)))),
            });
        Ok(Box::new(iter))
    }

    fn check(&self, res: &Resource<'_>) -> Result<bool> {
        Ok(self.full_path(res.handle().relative_path())?.is_file())
    }

    fn stream(&self, res: &Resource<'_>) -> Result<ContentStream> {
        let path = self.full_path(res.handle().relative_path())?;
        File::open(&path)
            .map(ContentStream::File)
            .map_err(|e| not_found_or_io(e, &path))
    }

    fn local_path(&self, res: &Resource<'_>) -> Result<LocalPath> {
        let path = self.full_path(res.handle().relative_path())?;
        if !path.is_file() {
            return Err(ModelError::not_found(path.display()));
        }
        Ok(LocalPath::Existing(path))
    }

    fn last_modified(&self, res: &Resource<'_>) -> Result<Option<DateTime<Utc>>> {
        let path = self.full_path(res.handle().relative_path())?;
        let meta = fs::metadata(&path).map_err(|e| not_found_or_io(e, &path))?;
        Ok(meta.modified().ok().map(DateTime::<Utc>::from))
    }

    fn size(&self, res: &Resource<'_>) -> Result<Option<u64>> {
        let path = self.full_path(res.handle().relative_path())?;
        let meta = fs::metadata(&path).map_err(|e| not_found_or_io(e, &path))?;
        Ok(Some(meta.len()))
    }
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn not_found_or_io(err: io::Error, path: &Path) -> ModelError {
    if err.kind() == io::ErrorKind::NotFound {
        ModelError::not_found(path.display())
    } else {
        ModelError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelSettings;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Arc<Source>) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("inside.txt"), "inside").unwrap();
        fs::write(temp_dir.path().join("secret.txt"), "outside").unwrap();
        let source = Arc::new(Source::File(FilesystemSource::new(root)));
        (temp_dir, source)
    }

    #[test]
    fn test_reads_files_below_root() {
        let (_temp_dir, source) = fixture();
        let sm = SourceManager::new(ModelSettings::default());
        let res = Handle::new(source, "inside.txt").follow(&sm);
        assert!(res.check().unwrap());
        assert_eq!(res.make_stream().unwrap().read_all().unwrap(), b"inside");
    }

    #[test]
    fn test_parent_and_absolute_paths_are_refused() {
        let (temp_dir, source) = fixture();
        let sm = SourceManager::new(ModelSettings::default());
        let absolute = temp_dir.path().join("secret.txt");

        for path in ["../secret.txt", "sub/../../secret.txt", absolute.to_str().unwrap(), ""] {
            let res = Handle::new(source.clone(), path).follow(&sm);
            assert!(res.make_stream().is_err(), "{path} was readable");
            let err = res.check().unwrap_err();
            assert!(err.is_missing());
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_out_of_root_is_refused() {
        let (temp_dir, source) = fixture();
        let Source::File(fs_source) = source.as_ref() else {
            unreachable!()
        };
        std::os::unix::fs::symlink(temp_dir.path().join("secret.txt"), fs_source.path.join("link.txt"))
            .unwrap();

        let sm = SourceManager::new(ModelSettings::default());
        let res = Handle::new(source.clone(), "link.txt").follow(&sm);
        assert!(res.make_stream().is_err());
        assert!(res.make_path().is_err());
    }
}
