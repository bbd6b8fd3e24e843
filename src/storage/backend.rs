//! Trait abstraction for storage pools to enable testing
//!
//! A pool is a flat namespace of files (a SPIFFS partition, an SD card
//! directory, ...). Components only ever talk to pools through these traits.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

/// An open file inside a pool
pub trait StorageFile: Read + Write + Seek + Send {
    /// Force written data down to the medium
    fn sync(&mut self) -> io::Result<()>;

    /// Cut the file down to `len` bytes
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl StorageFile for fs::File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// How a file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read only; the file must exist
    Read,
    /// Read and write in place; created empty if missing, never truncated
    ReadWrite,
    /// Writes always land at the end; created if missing
    Append,
    /// Created or truncated to zero length
    Truncate,
}

/// A named storage pool
pub trait StoragePool: Send + Sync {
    /// Pool name used in logs and errors
    fn name(&self) -> &str;

    /// Open a file
    fn open(&self, file: &str, mode: OpenMode) -> io::Result<Box<dyn StorageFile>>;

    /// File size, or `None` if it does not exist
    fn stat(&self, file: &str) -> io::Result<Option<u64>>;

    /// Remove a file; removing a missing file is not an error
    fn delete(&self, file: &str) -> io::Result<()>;

    /// Rename a file, replacing any existing target
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    /// Names of all files in the pool
    fn list(&self) -> io::Result<Vec<String>>;
}

/// Read exactly `len` bytes at `offset`
pub fn read_at(pool: &dyn StoragePool, file: &str, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    let mut handle = pool.open(file, OpenMode::Read)?;
    handle.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    handle.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read a whole file, or `None` if it does not exist
pub fn read_whole(pool: &dyn StoragePool, file: &str) -> io::Result<Option<Vec<u8>>> {
    let mut handle = match pool.open(file, OpenMode::Read) {
        Ok(handle) => handle,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut buf = Vec::new();
    handle.read_to_end(&mut buf)?;
    Ok(Some(buf))
}

/// Replace a file's content and sync it
pub fn write_whole(pool: &dyn StoragePool, file: &str, data: &[u8]) -> io::Result<()> {
    let mut handle = pool.open(file, OpenMode::Truncate)?;
    handle.write_all(data)?;
    handle.flush()?;
    handle.sync()
}

/// Replace a file's content through a synced sibling and a rename
///
/// Readers see either the old content or the new one, never a prefix.
pub fn replace_whole(pool: &dyn StoragePool, file: &str, data: &[u8]) -> io::Result<()> {
    let tmp = format!("{}.tmp", file);
    write_whole(pool, &tmp, data)?;
    pool.rename(&tmp, file)
}

/// Directory-backed pool (flash partition or SD card mount point)
#[derive(Debug, Clone)]
pub struct DirPool {
    name: String,
    root: PathBuf,
}

impl DirPool {
    /// Open a pool rooted at `root`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn open_dir<P: AsRef<Path>>(name: &str, root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!("Storage pool '{}' mounted at {}", name, root.display());
        Ok(Self {
            name: name.to_string(),
            root,
        })
    }

    /// Directory holding this pool's files
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }
}

impl StoragePool for DirPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, file: &str, mode: OpenMode) -> io::Result<Box<dyn StorageFile>> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::ReadWrite => options.read(true).write(true).create(true),
            OpenMode::Append => options.read(true).append(true).create(true),
            OpenMode::Truncate => options.write(true).create(true).truncate(true),
        };
        Ok(Box::new(options.open(self.path(file))?))
    }

    fn stat(&self, file: &str) -> io::Result<Option<u64>> {
        match fs::metadata(self.path(file)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete(&self, file: &str) -> io::Result<()> {
        match fs::remove_file(self.path(file)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.path(from), self.path(to))
    }

    fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
