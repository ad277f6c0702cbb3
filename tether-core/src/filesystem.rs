use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// File primitives the bridge relies on. The host decides how "save as"
/// picks a destination (usually a dialog).
pub trait FileSystem: Send + Sync {
    fn read_file(&self, path: &Path) -> Result<String>;

    fn save_file(&self, path: &Path, content: &str) -> Result<()>;

    /// Ask for a destination and write `content` there. `Ok(None)` means the
    /// user cancelled.
    fn save_file_as(&self, content: &str) -> Result<Option<PathBuf>>;
}

type SaveAsPicker = Box<dyn Fn() -> Option<PathBuf> + Send + Sync>;

/// `std::fs` backed implementation. Without a picker, "save as" is always
/// cancelled.
#[derive(Default)]
pub struct LocalFileSystem {
    save_as_picker: Option<SaveAsPicker>,
}

impl LocalFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_save_as_picker<F>(picker: F) -> Self
    where
        F: Fn() -> Option<PathBuf> + Send + Sync + 'static,
    {
        Self {
            save_as_picker: Some(Box::new(picker)),
        }
    }
}

impl FileSystem for LocalFileSystem {
    fn read_file(&self, path: &Path) -> Result<String> {
        if !path.is_file() {
            return Err(Error::file_io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "not a regular file"),
            ));
        }
        fs::read_to_string(path).map_err(|e| Error::file_io(path, e))
    }

    fn save_file(&self, path: &Path, content: &str) -> Result<()> {
        fs::write(path, content).map_err(|e| Error::file_io(path, e))
    }

    fn save_file_as(&self, content: &str) -> Result<Option<PathBuf>> {
        let Some(target) = self.save_as_picker.as_ref().and_then(|pick| pick()) else {
            return Ok(None);
        };
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::file_io(parent, e))?;
        }
        self.save_file(&target, content)?;
        Ok(Some(target))
    }
}
