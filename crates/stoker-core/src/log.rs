//! The write-through file log channel.
//!
//! Each write re-checks that the target is still the file we opened
//! (logrotate moves or deletes it out from under long-running daemons)
//! and reopens when the inode changed or the path is gone. Suppression
//! via the `log` event happens in the scheduler before the channel is
//! ever asked to write.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};
use crate::event::LogLevel;

/// A file-backed log target that survives rotation.
pub struct LogChannel {
    path: PathBuf,
    file: File,
    ino: u64,
    echo: bool,
    closed: bool,
}

impl LogChannel {
    /// Opens (appending, creating if needed) the log at `path`.
    ///
    /// # Errors
    /// Open or stat failures.
    pub fn open(path: impl Into<PathBuf>, echo: bool) -> Result<Self> {
        let path = path.into();
        let (file, ino) = open_target(&path)?;
        Ok(Self {
            path,
            file,
            ino,
            echo,
            closed: false,
        })
    }

    /// The target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line, reopening first when the target was rotated.
    ///
    /// # Errors
    /// Writing to a closed channel; reopen or write failures.
    pub fn write(&mut self, level: LogLevel, message: &str) -> Result<()> {
        if self.closed {
            return Err(CoreError::Log("log channel is closed".into()));
        }
        self.reopen_if_rotated()?;
        let line = format!(
            "{} [{level}] pid={} {message}\n",
            humantime::format_rfc3339_seconds(std::time::SystemTime::now()),
            std::process::id(),
        );
        self.file
            .write_all(line.as_bytes())
            .map_err(|e| CoreError::Log(format!("write {}: {e}", self.path.display())))?;
        if self.echo {
            let _ = std::io::stderr().write_all(line.as_bytes());
        }
        Ok(())
    }

    /// Closes the channel; later writes fail.
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn reopen_if_rotated(&mut self) -> Result<()> {
        let rotated = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.ino() != self.ino,
            Err(_) => true, // moved or deleted
        };
        if rotated {
            let (file, ino) = open_target(&self.path)?;
            self.file = file;
            self.ino = ino;
        }
        Ok(())
    }
}

fn open_target(path: &Path) -> Result<(File, u64)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CoreError::Log(format!("open {}: {e}", path.display())))?;
    let ino = file
        .metadata()
        .map_err(|e| CoreError::Log(format!("stat {}: {e}", path.display())))?
        .ino();
    Ok((file, ino))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("stoker-log-{tag}-{}.log", std::process::id()))
    }

    #[test]
    fn writes_lines() {
        let path = temp_path("basic");
        let mut chan = LogChannel::open(&path, false).unwrap();
        chan.write(LogLevel::Info, "hello").unwrap();
        chan.write(LogLevel::Warn, "again").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("[info]"));
        assert!(content.contains("hello"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reopens_after_rotation() {
        let path = temp_path("rotate");
        let rotated = temp_path("rotate-old");
        let mut chan = LogChannel::open(&path, false).unwrap();
        chan.write(LogLevel::Info, "before").unwrap();

        // Simulate logrotate: move the live file aside.
        std::fs::rename(&path, &rotated).unwrap();
        chan.write(LogLevel::Info, "after").unwrap();

        let fresh = std::fs::read_to_string(&path).unwrap();
        assert!(fresh.contains("after"));
        assert!(!fresh.contains("before"));
        let old = std::fs::read_to_string(&rotated).unwrap();
        assert!(old.contains("before"));

        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&rotated);
    }

    #[test]
    fn closed_channel_errors() {
        let path = temp_path("closed");
        let mut chan = LogChannel::open(&path, false).unwrap();
        chan.close();
        assert!(chan.write(LogLevel::Info, "nope").is_err());
        let _ = std::fs::remove_file(&path);
    }
}
