//! Directory ownership for a contact database.
//!
//! Only one process may own a database directory at a time; the in-process
//! write lock only gives serializable transactions if no other process is
//! appending to the same log. The owner writes its pid into `.lock`, and a
//! refused open reports that pid.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = ".lock";

/// Exclusive ownership of a database directory, released on drop.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Take ownership of `dir` without blocking.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` if another process owns the directory
    /// - any I/O error from creating or writing the lock file
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !os::try_lock_exclusive(&file)? {
            let holder = read_holder(&mut file).unwrap_or_else(|| "unknown".to_string());
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("contact database {} is owned by pid {holder}", dir.display()),
            ));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_holder(file: &mut File) -> Option<String> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    let pid = contents.trim();
    (!pid.is_empty()).then(|| pid.to_string())
}

#[cfg(unix)]
mod os {
    use std::fs::File;
    use std::io::{Error as IoError, Result as IoResult};
    use std::os::unix::io::AsRawFd;

    /// `Ok(false)` when another descriptor holds the lock.
    pub(super) fn try_lock_exclusive(file: &File) -> IoResult<bool> {
        // SAFETY: the descriptor is owned by `file` and outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = IoError::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[cfg(windows)]
mod os {
    use std::fs::File;
    use std::io::{Error as IoError, Result as IoResult};
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    /// `Ok(false)` when another handle holds the lock.
    pub(super) fn try_lock_exclusive(file: &File) -> IoResult<bool> {
        let handle = file.as_raw_handle() as HANDLE;
        // SAFETY: the handle is owned by `file`; OVERLAPPED is plain data.
        let ok = unsafe {
            let mut overlapped: OVERLAPPED = std::mem::zeroed();
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };
        if ok != 0 {
            return Ok(true);
        }
        let err = IoError::last_os_error();
        if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod os {
    use std::fs::File;
    use std::io::{Error as IoError, ErrorKind, Result as IoResult};

    pub(super) fn try_lock_exclusive(_file: &File) -> IoResult<bool> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "file locking not supported on this platform",
        ))
    }
}
