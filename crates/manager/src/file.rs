use std::path::{Path, PathBuf};

use serde_json::json;
use uuid::Uuid;

use taskmill_protocol::{FILE_FLAG_CACHE, FILE_FLAG_MOUNT_DIR, FILE_FLAG_SYMLINK_OK, FILE_FLAG_WATCH};

/// The kind of a file binding: where its bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// A file on the manager's filesystem.
    Local,
    /// A literal byte buffer held by the manager.
    Buffer,
    /// A URL the worker fetches itself.
    Url,
    /// A worker-resident temporary, transferable only between peers.
    Temp,
    /// A cache entry produced by running a small command on the worker.
    MiniTask,
    /// A directory tree on the manager's filesystem.
    Dir,
}

impl FileKind {
    fn tag(self) -> &'static str {
        match self {
            FileKind::Local => "file",
            FileKind::Buffer => "buffer",
            FileKind::Url => "url",
            FileKind::Temp => "temp",
            FileKind::MiniTask => "task",
            FileKind::Dir => "dir",
        }
    }
}

/// The command run on a worker to materialize a mini-task cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MiniTaskSpec {
    /// Shell command producing the entry.
    pub command: String,
    /// Inputs the command needs, staged like regular task inputs.
    pub inputs: Vec<File>,
}

impl MiniTaskSpec {
    pub(crate) fn to_json(&self) -> serde_json::Value {
        let inputs: Vec<serde_json::Value> = self
            .inputs
            .iter()
            .map(|f| {
                json!({
                    "cache_name": f.cache_name,
                    "remote_name": f.remote_name,
                    "flags": f.flags,
                    "source": f.url.clone().unwrap_or_default(),
                })
            })
            .collect();
        json!({ "command": self.command, "inputs": inputs })
    }
}

/// A named input or output of a task.
///
/// Inputs name the data a task needs inside its sandbox; outputs name the
/// files fetched back after execution (the local path is the destination the
/// output is moved to). Every binding carries a deterministic
/// content-addressed cache name so identical content shares one worker
/// cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub(crate) kind: FileKind,
    pub(crate) path: Option<PathBuf>,
    pub(crate) bytes: Option<Vec<u8>>,
    pub(crate) url: Option<String>,
    pub(crate) mini_task: Option<Box<MiniTaskSpec>>,
    pub(crate) remote_name: String,
    pub(crate) flags: u32,
    pub(crate) size: Option<u64>,
    pub(crate) cache_name: String,
    /// Source URI chosen at dispatch time when a peer substitutes for the
    /// origin. Cleared when the task leaves the worker.
    pub(crate) substitute: Option<String>,
}

fn digest_name(kind: FileKind, origin: &str, size: u64) -> String {
    let digest = md5::compute(format!("{}:{}:{}", kind.tag(), origin, size));
    format!("{}-md5-{:x}", kind.tag(), digest)
}

impl File {
    /// Bind a file on the manager's filesystem. As an input the file is
    /// staged into the sandbox; as an output the path is where the fetched
    /// file lands.
    pub fn local(path: impl Into<PathBuf>, remote_name: impl Into<String>) -> File {
        let path = path.into();
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let cache_name = digest_name(FileKind::Local, &path.to_string_lossy(), size);
        File {
            kind: FileKind::Local,
            path: Some(path),
            bytes: None,
            url: None,
            mini_task: None,
            remote_name: remote_name.into(),
            flags: 0,
            size: Some(size),
            cache_name,
            substitute: None,
        }
    }

    /// Bind a literal byte buffer as an input.
    pub fn buffer(bytes: impl Into<Vec<u8>>, remote_name: impl Into<String>) -> File {
        let bytes = bytes.into();
        let digest = md5::compute(&bytes);
        let cache_name = format!("buffer-md5-{digest:x}");
        let size = bytes.len() as u64;
        File {
            kind: FileKind::Buffer,
            path: None,
            bytes: Some(bytes),
            url: None,
            mini_task: None,
            remote_name: remote_name.into(),
            flags: 0,
            size: Some(size),
            cache_name,
            substitute: None,
        }
    }

    /// Bind a URL the worker fetches itself. `size` is the expected length,
    /// used for cache accounting and transfer timeouts.
    pub fn url(url: impl Into<String>, size: u64, remote_name: impl Into<String>) -> File {
        let url = url.into();
        let cache_name = digest_name(FileKind::Url, &url, size);
        File {
            kind: FileKind::Url,
            path: None,
            bytes: None,
            url: Some(url),
            mini_task: None,
            remote_name: remote_name.into(),
            flags: 0,
            size: Some(size),
            cache_name,
            substitute: None,
        }
    }

    /// Bind a worker-resident temporary. Temps never pass through the
    /// manager; they move between workers via peer transfers only.
    pub fn temp(remote_name: impl Into<String>) -> File {
        let cache_name = format!("temp-rnd-{}", Uuid::new_v4().simple());
        File {
            kind: FileKind::Temp,
            path: None,
            bytes: None,
            url: None,
            mini_task: None,
            remote_name: remote_name.into(),
            flags: FILE_FLAG_CACHE,
            size: None,
            cache_name,
            substitute: None,
        }
    }

    /// Bind a directory tree on the manager's filesystem as an input.
    pub fn dir(path: impl Into<PathBuf>, remote_name: impl Into<String>) -> File {
        let path = path.into();
        let cache_name = digest_name(FileKind::Dir, &path.to_string_lossy(), 0);
        File {
            kind: FileKind::Dir,
            path: Some(path),
            bytes: None,
            url: None,
            mini_task: None,
            remote_name: remote_name.into(),
            flags: FILE_FLAG_MOUNT_DIR,
            size: None,
            cache_name,
            substitute: None,
        }
    }

    /// Bind a cache entry produced by running `spec` on the worker.
    pub fn mini_task(spec: MiniTaskSpec, size: u64, remote_name: impl Into<String>) -> File {
        let origin = spec.to_json().to_string();
        let cache_name = digest_name(FileKind::MiniTask, &origin, size);
        File {
            kind: FileKind::MiniTask,
            path: None,
            bytes: None,
            url: None,
            mini_task: Some(Box::new(spec)),
            remote_name: remote_name.into(),
            flags: 0,
            size: Some(size),
            cache_name,
            substitute: None,
        }
    }

    /// Keep the file in the worker cache across tasks.
    pub fn cached(mut self) -> File {
        self.flags |= FILE_FLAG_CACHE;
        self
    }

    /// Stream partial content of this output back while the task runs.
    pub fn watched(mut self) -> File {
        self.flags |= FILE_FLAG_WATCH;
        self
    }

    /// Allow the worker to provide the file as a symlink into its cache.
    pub fn symlink_ok(mut self) -> File {
        self.flags |= FILE_FLAG_SYMLINK_OK;
        self
    }

    /// The content-addressed name of this binding in every worker cache.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// The name of the file inside the task sandbox.
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// The kind of this binding.
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub(crate) fn is_cached(&self) -> bool {
        self.flags & FILE_FLAG_CACHE != 0
    }

    pub(crate) fn is_watched(&self) -> bool {
        self.flags & FILE_FLAG_WATCH != 0
    }

    pub(crate) fn expected_size(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    pub(crate) fn mode_bits(&self) -> u32 {
        match self.kind {
            FileKind::Local | FileKind::Dir => self
                .path
                .as_deref()
                .and_then(unix_mode)
                .unwrap_or(0o755),
            _ => 0o755,
        }
    }
}

#[cfg(unix)]
fn unix_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .ok()
        .map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn unix_mode(_path: &Path) -> Option<u32> {
    None
}
