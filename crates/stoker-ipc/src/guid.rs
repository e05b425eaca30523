//! Transport tokens derived from (daemon executable, worker alias).
//!
//! The parent and a freshly exec'd child must independently arrive at
//! the same shared-memory and queue names without coordination. The
//! token is therefore derived `ftok`-style: a sentinel file whose name
//! is a normalized combination of the executable path and the alias is
//! placed in the temp directory, and the token combines that file's
//! inode with the first byte of the alias.

use std::fs::OpenOptions;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{IpcError, Result};

/// Stable identity of one mediator's transport.
///
/// Equal aliases under equal executables yield equal tokens, across
/// processes and across runs, for as long as the sentinel file exists.
#[derive(Debug)]
pub struct Guid {
    token: u32,
    alias: String,
    sentinel: PathBuf,
    owner: nix::unistd::Pid,
}

impl Guid {
    /// Derives the token for `alias` under the daemon binary at `exe`.
    ///
    /// Creates the sentinel file if it does not exist yet. The process
    /// that created the `Guid` unlinks the sentinel when the value is
    /// dropped; forked children sharing the value leave it alone.
    ///
    /// # Errors
    /// Fails when the sentinel cannot be created or stat'ed, or when
    /// `alias` is empty.
    pub fn derive(exe: &Path, alias: &str) -> Result<Self> {
        let Some(first) = alias.bytes().next() else {
            return Err(IpcError::Invalid("worker alias is empty".into()));
        };

        let sentinel = std::env::temp_dir().join(format!(
            "{}_{}.ftok",
            normalize(&exe.to_string_lossy()),
            normalize(alias)
        ));
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sentinel)?;
        let ino = std::fs::metadata(&sentinel)?.ino();

        // Same recipe as ftok(3): low inode bits plus a project byte.
        let token = ((ino & 0x00ff_ffff) as u32) | (u32::from(first) << 24);

        Ok(Self {
            token,
            alias: alias.to_string(),
            sentinel,
            owner: nix::unistd::getpid(),
        })
    }

    /// The numeric token.
    #[must_use]
    pub const fn token(&self) -> u32 {
        self.token
    }

    /// The worker alias this token was derived for.
    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Name of the payload-store segment.
    #[must_use]
    pub fn store_name(&self) -> String {
        format!("/stoker_{:08x}_store", self.token)
    }

    /// Name of the lock segment.
    #[must_use]
    pub fn lock_name(&self) -> String {
        format!("/stoker_{:08x}_lock", self.token)
    }

    /// Name of the header queue for the given message type suffix.
    #[must_use]
    pub fn queue_name(&self, suffix: &str) -> String {
        format!("/stoker_{:08x}_{suffix}", self.token)
    }

    /// Path of the sentinel file backing the token.
    #[must_use]
    pub fn sentinel(&self) -> &Path {
        &self.sentinel
    }
}

impl Drop for Guid {
    fn drop(&mut self) {
        // Only the deriving process removes the sentinel; a forked child
        // dropping its inherited copy must not invalidate the parent's
        // token (a re-created sentinel gets a fresh inode).
        if nix::unistd::getpid() == self.owner {
            let _ = std::fs::remove_file(&self.sentinel);
        }
    }
}

fn normalize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
