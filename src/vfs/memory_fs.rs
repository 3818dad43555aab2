use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{DirEntry, FileHandle, Filesystem};

/// An in-memory [`Filesystem`], for tests that exercise the engine without real disk I/O
/// (notably the crash-and-reopen scenario, where "crash" just means dropping the `MemoryFs`
/// handle for everything but the WAL).
#[derive(Debug, Default, Clone)]
pub struct MemoryFs {
    files: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>>>,
}

impl MemoryFs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: usize,
}

impl Read for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.lock();
        let remaining = data.len().saturating_sub(self.pos);
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock();
        let end = self.pos + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.lock().len() as i64;
        let new_pos = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => len + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if new_pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "negative seek"));
        }
        self.pos = new_pos as usize;
        Ok(self.pos as u64)
    }
}

impl FileHandle for MemoryFile {
    fn sync_all(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.lock().len() as u64)
    }
}

impl Filesystem for MemoryFs {
    fn create(&self, path: &Path) -> io::Result<Box<dyn FileHandle>> {
        let data = Arc::new(Mutex::new(Vec::new()));
        self.files.lock().insert(path.to_path_buf(), Arc::clone(&data));
        Ok(Box::new(MemoryFile { data, pos: 0 }))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn FileHandle>> {
        let data = self
            .files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))?;
        Ok(Box::new(MemoryFile { data, pos: 0 }))
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn FileHandle>> {
        let mut files = self.files.lock();
        let data = files.entry(path.to_path_buf()).or_insert_with(|| Arc::new(Mutex::new(Vec::new())));
        let data = Arc::clone(data);
        let pos = data.lock().len();
        Ok(Box::new(MemoryFile { data, pos }))
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.files.lock().remove(path);
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        self.files.lock().retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
        // `MemoryFs` has no directory entities distinct from the files placed under them.
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut files = self.files.lock();
        if let Some(data) = files.remove(from) {
            files.insert(to.to_path_buf(), data);
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, from.display().to_string()))
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let files = self.files.lock();
        Ok(files
            .keys()
            .filter(|p| p.parent() == Some(path))
            .map(|p| DirEntry { path: p.clone(), is_dir: false })
            .collect())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    fn file_len(&self, path: &Path) -> io::Result<u64> {
        self.files
            .lock()
            .get(path)
            .map(|data| data.lock().len() as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }
}
