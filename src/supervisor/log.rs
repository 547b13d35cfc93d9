//! Append-only diagnostics log for endpoint output.
//!
//! Every endpoint line is written as `<rfc3339> [stdout|stderr] <line>`.
//! The supervisor's own `tracing` output goes to the same file through a
//! separate handle; both use append mode so lines don't clobber each other.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Which endpoint stream produced a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Log file handle. A log that can't be opened or written degrades to a
/// no-op; losing diagnostics must not end the session.
pub struct SessionLog {
    path: PathBuf,
    file: Option<fs::File>,
}

impl SessionLog {
    /// Open `path` for appending, creating parent directories.
    pub async fn open(path: &Path) -> Self {
        let file = match open_append(path).await {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("Cannot open log file {}: {e}", path.display());
                None
            }
        };
        Self {
            path: path.to_path_buf(),
            file,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one endpoint line tagged with its stream.
    pub async fn append(&mut self, stream: OutputStream, line: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let entry = format!(
            "{} [{}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            stream.as_str(),
            line.trim_end_matches('\r')
        );
        if let Err(e) = file.write_all(entry.as_bytes()).await {
            warn!("Log write to {} failed, disabling: {e}", self.path.display());
            self.file = None;
            return;
        }
        let _ = file.flush().await;
    }
}

async fn open_append(path: &Path) -> std::io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}
