// src/fs.rs
use std::ffi::CString;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;

use libc::c_void;

/// Resolution failures, mapped to 404 / 403 / 400 / 500 by the response
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    NotFound,
    Forbidden,
    IsDirectory,
    Io,
}

/// Read-only memory-mapped view of a file, referenced directly by the
/// response writer. The mapping is released exactly once, on drop, no
/// matter which path the response takes.
pub struct FileMap {
    addr: *mut c_void,
    len: usize,
}

unsafe impl Send for FileMap {}

impl FileMap {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
        }
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        if !self.addr.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.addr, self.len);
            }
        }
    }
}

/// The document-root collaborator: joins a validated origin-form path with
/// the configured prefix and produces a mappable handle or a typed refusal.
pub struct DocRoot {
    root: PathBuf,
}

impl DocRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Checks mirror the serving rules: the file must exist, be readable by
    /// others, and not be a directory. `..` segments never escape the root.
    pub fn resolve(&self, target: &str) -> Result<FileMap, FileError> {
        if target.split('/').any(|segment| segment == "..") {
            return Err(FileError::Forbidden);
        }
        let full = self.root.join(target.trim_start_matches('/'));
        let c_path = CString::new(full.as_os_str().as_bytes()).map_err(|_| FileError::NotFound)?;

        let mut st: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::stat(c_path.as_ptr(), &mut st) } < 0 {
            return Err(FileError::NotFound);
        }
        if st.st_mode & libc::S_IROTH == 0 {
            return Err(FileError::Forbidden);
        }
        if (st.st_mode & libc::S_IFMT) == libc::S_IFDIR {
            return Err(FileError::IsDirectory);
        }

        let size = st.st_size as usize;
        if size == 0 {
            // mmap rejects zero-length mappings.
            return Ok(FileMap {
                addr: ptr::null_mut(),
                len: 0,
            });
        }

        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(FileError::Io);
        }
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        unsafe {
            libc::close(fd);
        }
        if addr == libc::MAP_FAILED {
            return Err(FileError::Io);
        }

        Ok(FileMap { addr, len: size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn fixture() -> (tempfile::TempDir, DocRoot) {
        let dir = tempfile::tempdir().unwrap();
        let root = DocRoot::new(dir.path());
        (dir, root)
    }

    #[test]
    fn maps_a_readable_file() {
        let (dir, root) = fixture();
        fs::write(dir.path().join("index.html"), b"<h1>hello</h1>").unwrap();
        fs::set_permissions(
            dir.path().join("index.html"),
            fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        let map = root.resolve("/index.html").unwrap();
        assert_eq!(map.len(), 14);
        assert_eq!(map.as_slice(), b"<h1>hello</h1>");
    }

    #[test]
    fn missing_file_is_not_found() {
        let (_dir, root) = fixture();
        assert!(matches!(root.resolve("/nope.html"), Err(FileError::NotFound)));
    }

    #[test]
    fn unreadable_file_is_forbidden() {
        let (dir, root) = fixture();
        let path = dir.path().join("secret.html");
        fs::write(&path, b"private").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();

        assert!(matches!(root.resolve("/secret.html"), Err(FileError::Forbidden)));
    }

    #[test]
    fn directory_is_rejected() {
        let (dir, root) = fixture();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::set_permissions(dir.path().join("sub"), fs::Permissions::from_mode(0o755)).unwrap();

        assert!(matches!(root.resolve("/sub"), Err(FileError::IsDirectory)));
    }

    #[test]
    fn traversal_is_forbidden() {
        let (_dir, root) = fixture();
        assert!(matches!(
            root.resolve("/../etc/passwd"),
            Err(FileError::Forbidden)
        ));
    }

    #[test]
    fn empty_file_maps_to_empty_region() {
        let (dir, root) = fixture();
        let path = dir.path().join("empty.html");
        fs::write(&path, b"").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let map = root.resolve("/empty.html").unwrap();
        assert!(map.is_empty());
        assert_eq!(map.as_slice(), b"");
    }
}
