//! Filesystem module
//!
//! Relative paths resolve against the loop's work directory at call time.
//! Results come back as `callback(null, result)` under `fs.<op>`; failures as
//! `callback(err)` under `fs.<op>.error` with `code`, `syscall` and `path` set.

use nodus_engine::{Event, LoopError, LoopHandle, Logger, Logging};
use nodus_sdk::{CallbackRef, ErrorValue, Value};

use std::fmt;
use std::fs::{self, DirBuilder, Metadata};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Mode used by `mkdir` when none is given
pub const DEFAULT_DIR_MODE: u32 = 0o777;

// ============================================================================
// Stats
// ============================================================================

fn millis(time: io::Result<std::time::SystemTime>) -> f64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

/// Script-side `fs.Stats` object for `meta`
pub fn stats_value(meta: &Metadata) -> Value {
    let file_type = meta.file_type();
    Value::object([
        ("dev", Value::from(meta.dev())),
        ("ino", Value::from(meta.ino())),
        ("mode", Value::from(meta.permissions().mode())),
        ("nlink", Value::from(meta.nlink())),
        ("uid", Value::from(meta.uid())),
        ("gid", Value::from(meta.gid())),
        ("size", Value::from(meta.len())),
        ("atimeMs", Value::from(millis(meta.accessed()))),
        ("mtimeMs", Value::from(millis(meta.modified()))),
        ("ctimeMs", Value::from((meta.ctime() * 1000) as f64)),
        ("isFile", Value::from(file_type.is_file())),
        ("isDirectory", Value::from(file_type.is_dir())),
        ("isSymbolicLink", Value::from(file_type.is_symlink())),
    ])
}

/// Directory entry names, sorted
fn read_dir_names(path: &Path) -> io::Result<Vec<String>> {
    let mut names = fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .collect::<io::Result<Vec<_>>>()?;
    names.sort();
    Ok(names)
}

// ============================================================================
// Fs
// ============================================================================

/// Filesystem functions bound to one loop
#[derive(Clone)]
pub struct Fs {
    handle: LoopHandle,
    log: Logger,
}

impl Fs {
    /// Create the fs functions for the loop behind `handle`
    pub fn new(handle: LoopHandle, logging: &Logging) -> Self {
        Self {
            handle,
            log: logging.get("fs"),
        }
    }

    /// `fs.stat(path, cb)`; follows symlinks
    pub fn stat(&self, path: impl AsRef<Path>, callback: CallbackRef) -> Result<(), LoopError> {
        self.run("stat", path.as_ref(), callback, |p| {
            Ok(vec![stats_value(&fs::metadata(p)?)])
        })
    }

    /// `fs.lstat(path, cb)`; reports the link itself
    pub fn lstat(&self, path: impl AsRef<Path>, callback: CallbackRef) -> Result<(), LoopError> {
        self.run("lstat", path.as_ref(), callback, |p| {
            Ok(vec![stats_value(&fs::symlink_metadata(p)?)])
        })
    }

    /// `fs.mkdir(path, mode?, cb)`
    pub fn mkdir(
        &self,
        path: impl AsRef<Path>,
        mode: Option<u32>,
        callback: CallbackRef,
    ) -> Result<(), LoopError> {
        let mode = mode.unwrap_or(DEFAULT_DIR_MODE);
        self.run("mkdir", path.as_ref(), callback, move |p| {
            DirBuilder::new().mode(mode).create(p)?;
            Ok(Vec::new())
        })
    }

    /// `fs.rmdir(path, cb)`
    pub fn rmdir(&self, path: impl AsRef<Path>, callback: CallbackRef) -> Result<(), LoopError> {
        self.run("rmdir", path.as_ref(), callback, |p| {
            fs::remove_dir(p)?;
            Ok(Vec::new())
        })
    }

    /// `fs.readdir(path, cb)`; names come back sorted
    pub fn readdir(&self, path: impl AsRef<Path>, callback: CallbackRef) -> Result<(), LoopError> {
        self.run("readdir", path.as_ref(), callback, |p| {
            Ok(vec![Value::from(read_dir_names(p)?)])
        })
    }

    /// `fs.readFile(path, cb)`; contents as bytes
    pub fn read_file(&self, path: impl AsRef<Path>, callback: CallbackRef) -> Result<(), LoopError> {
        self.run("read", path.as_ref(), callback, |p| Ok(vec![Value::Bytes(fs::read(p)?)]))
    }

    /// `fs.writeFile(path, data, cb)`; creates or truncates
    pub fn write_file(
        &self,
        path: impl AsRef<Path>,
        data: Vec<u8>,
        callback: CallbackRef,
    ) -> Result<(), LoopError> {
        self.run("write", path.as_ref(), callback, move |p| {
            fs::write(p, &data)?;
            Ok(Vec::new())
        })
    }

    /// `fs.unlink(path, cb)`
    pub fn unlink(&self, path: impl AsRef<Path>, callback: CallbackRef) -> Result<(), LoopError> {
        self.run("unlink", path.as_ref(), callback, |p| {
            fs::remove_file(p)?;
            Ok(Vec::new())
        })
    }

    /// `fs.rename(from, to, cb)`
    pub fn rename(
        &self,
        from: impl AsRef<Path>,
        to: impl AsRef<Path>,
        callback: CallbackRef,
    ) -> Result<(), LoopError> {
        let to = self.handle.resolve_path(to);
        self.run("rename", from.as_ref(), callback, move |p| {
            fs::rename(p, &to)?;
            Ok(Vec::new())
        })
    }

    /// `fs.realpath(path, cb)`
    pub fn realpath(&self, path: impl AsRef<Path>, callback: CallbackRef) -> Result<(), LoopError> {
        self.run("realpath", path.as_ref(), callback, |p| {
            Ok(vec![Value::from(fs::canonicalize(p)?.to_string_lossy().into_owned())])
        })
    }

    /// Run `work` on the pool and post the error-first result.
    ///
    /// `syscall` names both the event (`fs.<syscall>`) and the error's
    /// `syscall` field.
    fn run<F>(
        &self,
        syscall: &'static str,
        path: &Path,
        callback: CallbackRef,
        work: F,
    ) -> Result<(), LoopError>
    where
        F: FnOnce(&Path) -> io::Result<Vec<Value>> + Send + 'static,
    {
        let path: PathBuf = self.handle.resolve_path(path);
        let handle = self.handle.clone();
        let log = self.log.clone();
        self.handle.submit(move || {
            let event = match work(&path) {
                Ok(results) => {
                    let mut args = Vec::with_capacity(results.len() + 1);
                    args.push(Value::Null);
                    args.extend(results);
                    Event::new(format!("fs.{}", syscall), callback, args)
                }
                Err(e) => {
                    log.debug(format_args!("{} {} failed: {}", syscall, path.display(), e));
                    let error = ErrorValue::from_io(&e, syscall)
                        .with_path(path.to_string_lossy().into_owned());
                    Event::new(format!("fs.{}.error", syscall), callback, vec![Value::Error(error)])
                }
            };
            handle.post(event);
        })?;
        Ok(())
    }
}

impl fmt::Debug for Fs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fs")
            .field("loop", &self.handle.instance())
            .field("work_dir", &self.handle.work_dir())
            .finish()
    }
}
