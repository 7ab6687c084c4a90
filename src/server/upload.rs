//! Staged pack uploads
//!
//! A pack is written to `<name>.tmp` in the pack directory and only renamed
//! to its final name once it has been synced, so listings never observe a
//! partial pack.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Suffix of staged upload files
pub const TMP_SUFFIX: &str = ".tmp";

/// Upload errors
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid upload name {0:?}")]
    InvalidName(String),

    /// A write failed earlier in this session
    #[error("upload failed: {0}")]
    Failed(String),
}

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// One pack being staged on local disk
pub struct UploadSession {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
    written: u64,
    error: Option<String>,
}

impl UploadSession {
    /// Start staging `name` inside `dir`
    pub fn create(dir: &Path, name: &str) -> UploadResult<Self> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(UploadError::InvalidName(name.to_string()));
        }

        let tmp_path = dir.join(format!("{}{}", name, TMP_SUFFIX));
        let final_path = dir.join(name);
        if final_path.exists() {
            return Err(UploadError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", final_path.display()),
            )));
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        log::debug!("staging upload at {}", tmp_path.display());

        Ok(Self {
            tmp_path,
            final_path,
            file: Some(file),
            written: 0,
            error: None,
        })
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append to the staged file.
    ///
    /// The first failure becomes terminal: it is returned again by every
    /// later write and by `close`, and nothing more is written.
    pub fn write(&mut self, data: &[u8]) -> UploadResult<()> {
        if let Some(e) = &self.error {
            return Err(UploadError::Failed(e.clone()));
        }
        let file = match self.file.as_mut() {
            Some(f) => f,
            None => return Err(UploadError::Failed("upload already finished".to_string())),
        };
        match file.write_all(data) {
            Ok(()) => {
                self.written += data.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.error = Some(e.to_string());
                Err(UploadError::Io(e))
            }
        }
    }

    /// Sync and rename into place. Returns the committed size.
    pub fn close(mut self) -> UploadResult<u64> {
        if let Some(e) = self.error.take() {
            self.discard();
            return Err(UploadError::Failed(e));
        }
        let file = match self.file.take() {
            Some(f) => f,
            None => return Err(UploadError::Failed("upload already finished".to_string())),
        };

        if let Err(e) = file.sync_all() {
            drop(file);
            self.discard();
            return Err(e.into());
        }
        drop(file);

        if let Err(e) = fs::rename(&self.tmp_path, &self.final_path) {
            self.discard();
            return Err(e.into());
        }
        log::debug!("committed {} ({} bytes)", self.final_path.display(), self.written);
        Ok(self.written)
    }

    /// Drop the staged file, whatever state the session is in
    pub fn cancel(mut self) -> UploadResult<()> {
        self.file.take();
        match fs::remove_file(&self.tmp_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn discard(&mut self) {
        self.file.take();
        if let Err(e) = fs::remove_file(&self.tmp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("failed to remove {}: {}", self.tmp_path.display(), e);
            }
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        // still open means neither close nor cancel ran
        if self.file.is_some() {
            log::warn!("abandoned upload {}", self.tmp_path.display());
            self.discard();
        }
    }
}

/// Remove staged files in `dir` older than `max_age`. Returns how many
/// were removed.
pub fn sweep_temp_files(dir: &Path, max_age: Duration) -> io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_tmp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(TMP_SUFFIX))
            .unwrap_or(false);
        if !is_tmp {
            continue;
        }

        let modified = entry.metadata()?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age <= max_age {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                log::info!("removed stale upload {}", path.display());
                removed += 1;
            }
            Err(e) => log::warn!("failed to remove stale upload {}: {}", path.display(), e),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_close_commits() {
        let dir = TempDir::new().unwrap();
        let mut up = UploadSession::create(dir.path(), "a.pack").unwrap();
        up.write(b"hello ").unwrap();
        up.write(b"world").unwrap();
        assert!(dir.path().join("a.pack.tmp").exists());
        assert!(!dir.path().join("a.pack").exists());

        assert_eq!(up.close().unwrap(), 11);
        assert!(!dir.path().join("a.pack.tmp").exists());
        assert_eq!(fs::read(dir.path().join("a.pack")).unwrap(), b"hello world");
    }

    #[test]
    fn test_cancel_discards() {
        let dir = TempDir::new().unwrap();
        let mut up = UploadSession::create(dir.path(), "a.pack").unwrap();
        up.write(b"data").unwrap();
        up.cancel().unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_drop_discards() {
        let dir = TempDir::new().unwrap();
        {
            let mut up = UploadSession::create(dir.path(), "a.pack").unwrap();
            up.write(b"data").unwrap();
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_terminal_error() {
        let dir = TempDir::new().unwrap();
        let mut up = UploadSession::create(dir.path(), "a.pack").unwrap();
        up.error = Some("disk full".to_string());

        assert!(matches!(up.write(b"x"), Err(UploadError::Failed(_))));
        assert!(matches!(up.write(b"y"), Err(UploadError::Failed(_))));
        assert!(matches!(up.close(), Err(UploadError::Failed(m)) if m == "disk full"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_name_collisions() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.pack"), b"x").unwrap();
        assert!(UploadSession::create(dir.path(), "b.pack").is_err());

        let _up = UploadSession::create(dir.path(), "c.pack").unwrap();
        assert!(UploadSession::create(dir.path(), "c.pack").is_err());
        assert!(matches!(
            UploadSession::create(dir.path(), "../c.pack"),
            Err(UploadError::InvalidName(_))
        ));
    }

    #[test]
    fn test_sweep_temp_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("old.pack.tmp"), b"x").unwrap();
        fs::write(dir.path().join("keep.pack"), b"x").unwrap();

        // nothing is older than a day
        assert_eq!(sweep_temp_files(dir.path(), Duration::from_secs(86400)).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sweep_temp_files(dir.path(), Duration::from_millis(1)).unwrap(), 1);
        assert!(!dir.path().join("old.pack.tmp").exists());
        assert!(dir.path().join("keep.pack").exists());
    }
}
