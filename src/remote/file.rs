//! Remote file variants

use super::{RemoteError, RemoteFile, RemoteResult};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Pack file on local disk
pub struct OsFile {
    file: Option<File>,
}

impl OsFile {
    pub fn open<P: AsRef<Path>>(path: P) -> RemoteResult<Self> {
        let file = File::open(path)?;
        Ok(Self { file: Some(file) })
    }

    /// Length of the file on disk
    pub fn len(&self) -> RemoteResult<u64> {
        Ok(self.handle()?.metadata()?.len())
    }

    fn handle(&self) -> RemoteResult<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| RemoteError::BadRequest("file already closed".to_string()))
    }
}

impl RemoteFile for OsFile {
    fn read_at(&self, offset: u64, len: usize) -> RemoteResult<Vec<u8>> {
        let file = self.handle()?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn close(&mut self) -> RemoteResult<()> {
        // dropping the File closes the descriptor
        self.file.take();
        Ok(())
    }
}

/// In-memory file, used for generated content such as pack listings
pub struct MemFile {
    data: Vec<u8>,
    closed: bool,
    closes: Arc<AtomicUsize>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            closed: false,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter incremented on every `close` call
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

impl RemoteFile for MemFile {
    fn read_at(&self, offset: u64, len: usize) -> RemoteResult<Vec<u8>> {
        if self.closed {
            return Err(RemoteError::BadRequest("file already closed".to_string()));
        }
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }

    fn close(&mut self) -> RemoteResult<()> {
        self.closed = true;
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_os_file_read_at() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        tmp.flush().unwrap();

        let mut f = OsFile::open(tmp.path()).unwrap();
        assert_eq!(f.len().unwrap(), 10);
        assert_eq!(f.read_at(3, 4).unwrap(), b"3456");
        assert_eq!(f.read_at(8, 10).unwrap(), b"89");
        assert!(f.read_at(20, 4).unwrap().is_empty());

        f.close().unwrap();
        assert!(f.read_at(0, 1).is_err());
    }

    #[test]
    fn test_mem_file() {
        let mut f = MemFile::new(b"listing".to_vec());
        let closes = f.close_counter();
        assert_eq!(f.read_at(0, 4).unwrap(), b"list");
        assert_eq!(f.read_at(4, 100).unwrap(), b"ing");
        assert!(f.read_at(u64::MAX, 1).unwrap().is_empty());
        f.close().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(f.read_at(0, 1).is_err());
    }
}
