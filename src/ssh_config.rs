//! Idempotent management of one `Host` block in an SSH client config file.
//!
//! This is not an SSH config parser. A block is recognized by a line that is
//! exactly `Host <alias>` followed by any number of lines starting with a space
//! or a tab. Field order inside the block does not matter for detection, and
//! the block we write always has the same shape:
//!
//! ```text
//! Host <alias>
//!   HostName localhost
//!   Port <port>
//!   User <user>
//! ```
//!
//! Crashed earlier runs can leave several blocks for the same alias. An upsert
//! removes all of them and appends a fresh one, so the file always ends up with
//! exactly one.

use std::ops::Range;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::SessionError;

/// Connection parameters for a managed alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlock {
    pub alias: String,
    pub port: u16,
    pub user: String,
}

impl ConfigBlock {
    pub fn new(alias: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            port,
            user: user.into(),
        }
    }

    /// Render the block, newline-terminated.
    pub fn render(&self) -> String {
        format!(
            "Host {}\n  HostName localhost\n  Port {}\n  User {}\n",
            self.alias, self.port, self.user
        )
    }
}

/// Byte ranges of every block for `alias` in `content`.
///
/// A range covers the `Host` line and its continuation lines, including the
/// final line terminator when there is one.
pub fn find_host_blocks(content: &str, alias: &str) -> Vec<Range<usize>> {
    let header = format!("Host {alias}");
    let mut blocks = Vec::new();
    let mut current: Option<Range<usize>> = None;
    let mut offset = 0;

    for line in content.split_inclusive('\n') {
        let start = offset;
        offset += line.len();
        let body = line.trim_end_matches(['\n', '\r']);

        if let Some(ref mut block) = current {
            if body.starts_with(' ') || body.starts_with('\t') {
                block.end = offset;
                continue;
            }
            blocks.push(block.clone());
            current = None;
        }

        if body.trim_end() == header {
            current = Some(start..offset);
        }
    }
    if let Some(block) = current {
        blocks.push(block);
    }
    blocks
}

/// Collapse every run of three or more newlines into a single blank line.
fn collapse_blank_runs(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut newlines = 0usize;
    for ch in content.chars() {
        if ch == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(ch);
            }
        } else if ch == '\r' {
            // Keep CR only if its LF is kept
            if newlines < 2 {
                out.push(ch);
            }
        } else {
            newlines = 0;
            out.push(ch);
        }
    }
    out
}

fn remove_ranges(content: &str, ranges: &[Range<usize>]) -> String {
    let mut out = String::with_capacity(content.len());
    let mut last = 0;
    for r in ranges {
        out.push_str(&content[last..r.start]);
        last = r.end;
    }
    out.push_str(&content[last..]);
    out
}

/// Remove `ranges` and tidy the blank lines the removal leaves behind.
fn cut_blocks(content: &str, ranges: &[Range<usize>]) -> String {
    collapse_blank_runs(&remove_ranges(content, ranges))
        .trim_start_matches(['\n', '\r'])
        .to_string()
}

fn append_block(content: &str, rendered: &str) -> String {
    let existing = content.trim_end_matches(['\n', '\r']);
    if existing.is_empty() {
        rendered.to_string()
    } else {
        format!("{existing}\n\n{rendered}")
    }
}

/// Compute the new file contents for an upsert of `block` into `content`.
pub fn apply_upsert(content: &str, block: &ConfigBlock) -> String {
    let rendered = block.render();
    let mut content = content.to_string();
    let mut blocks = find_host_blocks(&content, &block.alias);

    if blocks.len() > 1 {
        warn!(
            "Found {} blocks for Host {}, removing duplicates",
            blocks.len(),
            block.alias
        );
        content = cut_blocks(&content, &blocks);
        blocks = find_host_blocks(&content, &block.alias);
    }

    if let [only] = blocks.as_slice() {
        let mut out = String::with_capacity(content.len() + rendered.len());
        out.push_str(&content[..only.start]);
        out.push_str(&rendered);
        out.push_str(&content[only.end..]);
        out
    } else {
        append_block(&content, &rendered)
    }
}

async fn read_or_empty(path: &Path) -> Result<String, SessionError> {
    match tokio::fs::read_to_string(path).await {
        Ok(c) => Ok(c),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(SessionError::ConfigWriteFailure {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn write_config(path: &Path, content: &str) -> Result<(), SessionError> {
    let wrap = |source| SessionError::ConfigWriteFailure {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(wrap)?;
        }
    }
    tokio::fs::write(path, content).await.map_err(wrap)
}

/// Ensure `path` holds exactly one block for `block.alias` with the given
/// parameters.
///
/// Returns whether a re-scan of the written file finds exactly one block.
pub async fn upsert_host_block(path: &Path, block: &ConfigBlock) -> Result<bool, SessionError> {
    let content = read_or_empty(path).await?;
    let updated = apply_upsert(&content, block);
    if updated != content {
        write_config(path, &updated).await?;
        info!(
            "Updated Host {} in {} (port {})",
            block.alias,
            path.display(),
            block.port
        );
    } else {
        debug!("Host {} in {} already up to date", block.alias, path.display());
    }

    let written = read_or_empty(path).await?;
    Ok(find_host_blocks(&written, &block.alias).len() == 1)
}

/// Remove every block for `alias`. Returns how many were removed.
pub async fn remove_host_block(path: &Path, alias: &str) -> Result<usize, SessionError> {
    let content = read_or_empty(path).await?;
    let blocks = find_host_blocks(&content, alias);
    if blocks.is_empty() {
        return Ok(0);
    }
    let mut updated = cut_blocks(&content, &blocks);
    let trimmed_len = updated.trim_end_matches(['\n', '\r']).len();
    if trimmed_len == 0 {
        updated.clear();
    } else {
        updated.truncate(trimmed_len);
        updated.push('\n');
    }
    write_config(path, &updated).await?;
    info!("Removed {} block(s) for Host {alias} from {}", blocks.len(), path.display());
    Ok(blocks.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(port: u16) -> ConfigBlock {
        ConfigBlock::new("cml", port, "cdsw")
    }

    #[test]
    fn render_exact_format() {
        assert_eq!(
            block(2223).render(),
            "Host cml\n  HostName localhost\n  Port 2223\n  User cdsw\n"
        );
    }

    #[test]
    fn empty_file_gets_sole_block() {
        assert_eq!(apply_upsert("", &block(2223)), block(2223).render());
    }

    #[test]
    fn appends_after_blank_line() {
        let existing = "Host github.com\n  User git\n";
        let out = apply_upsert(existing, &block(2223));
        assert_eq!(
            out,
            "Host github.com\n  User git\n\nHost cml\n  HostName localhost\n  Port 2223\n  User cdsw\n"
        );
    }

    #[test]
    fn append_to_file_without_trailing_newline() {
        let out = apply_upsert("Host other\n  User me", &block(1));
        assert!(out.starts_with("Host other\n  User me\n\nHost cml\n"));
    }

    #[test]
    fn replaces_single_block_in_place() {
        let existing = "Host a\n  User x\n\nHost cml\n  User old\n  Port 1\n  HostName localhost\n\nHost b\n  User y\n";
        let out = apply_upsert(existing, &block(2223));
        assert_eq!(
            out,
            "Host a\n  User x\n\nHost cml\n  HostName localhost\n  Port 2223\n  User cdsw\n\nHost b\n  User y\n"
        );
    }

    #[test]
    fn alias_prefix_does_not_match() {
        let existing = "Host cml-prod\n  Port 22\n";
        assert!(find_host_blocks(existing, "cml").is_empty());
        let out = apply_upsert(existing, &block(2));
        assert_eq!(find_host_blocks(&out, "cml-prod").len(), 1);
        assert_eq!(find_host_blocks(&out, "cml").len(), 1);
    }

    #[test]
    fn tolerates_crlf_and_trailing_spaces() {
        let existing = "Host cml  \r\n  Port 1\r\n";
        assert_eq!(find_host_blocks(existing, "cml"), vec![0..existing.len()]);
    }

    #[test]
    fn block_ends_at_unindented_line() {
        let existing = "Host cml\n  Port 1\n# comment\n  orphan indented\n";
        let blocks = find_host_blocks(existing, "cml");
        assert_eq!(blocks, vec![0.."Host cml\n  Port 1\n".len()]);
    }

    #[test]
    fn idempotent_twice() {
        let first = apply_upsert("Host a\n  User x\n", &block(2223));
        let second = apply_upsert(&first, &block(2223));
        assert_eq!(first, second);
    }

    #[test]
    fn idempotent_after_dedup() {
        let corrupt = "Host cml\n  Port 1\n\nHost cml\n  Port 2\n";
        let first = apply_upsert(corrupt, &block(3));
        let second = apply_upsert(&first, &block(3));
        assert_eq!(first, second);
    }

    #[test]
    fn corruption_recovery_leaves_one_block() {
        let corrupt = "Host a\n  User x\n\nHost cml\n  Port 1\n\n\nHost cml\n  User z\n  Port 2\n\nHost b\n  User y\n\nHost cml\n";
        let out = apply_upsert(corrupt, &block(4444));
        let blocks = find_host_blocks(&out, "cml");
        assert_eq!(blocks.len(), 1);
        assert_eq!(&out[blocks[0].clone()], block(4444).render());
        assert!(!out.contains("\n\n\n"));
        assert!(out.contains("Host a\n  User x\n"));
        assert!(out.contains("Host b\n  User y\n"));
    }

    #[test]
    fn duplicates_at_top_leave_no_leading_blank_lines() {
        let content = "Host cml\n  Port 1\n\nHost cml\n  Port 2\n\nHost other\n  Port 3\n";
        let out = apply_upsert(content, &block(2223));
        assert!(out.starts_with("Host other\n  Port 3\n"), "{out:?}");
        assert!(out.ends_with(&block(2223).render()));
        assert_eq!(find_host_blocks(&out, "cml").len(), 1);
        assert_eq!(apply_upsert(&out, &block(2223)), out);
    }

    #[tokio::test]
    async fn removing_leading_block_leaves_no_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "Host cml\n  Port 1\n\nHost other\n  Port 3\n").unwrap();
        assert_eq!(remove_host_block(&path, "cml").await.unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Host other\n  Port 3\n");
    }

    #[test]
    fn collapse_blank_runs_keeps_single_blank_line() {
        assert_eq!(collapse_blank_runs("a\n\n\n\nb\n"), "a\n\nb\n");
        assert_eq!(collapse_blank_runs("a\n\nb"), "a\n\nb");
        assert_eq!(collapse_blank_runs("a\r\n\r\n\r\nb"), "a\r\n\r\nb");
    }

    #[tokio::test]
    async fn upsert_creates_missing_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ssh/config");
        assert!(upsert_host_block(&path, &block(2223)).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), block(2223).render());
    }

    #[tokio::test]
    async fn upsert_twice_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "Host github.com\n  User git\n").unwrap();

        assert!(upsert_host_block(&path, &block(2223)).await.unwrap());
        let first = std::fs::read(&path).unwrap();
        assert!(upsert_host_block(&path, &block(2223)).await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[tokio::test]
    async fn upsert_repairs_duplicates_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "Host cml\n  Port 1\n\nHost cml\n  Port 2\n").unwrap();

        assert!(upsert_host_block(&path, &block(9000)).await.unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, block(9000).render());
    }

    #[tokio::test]
    async fn upsert_reports_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be
        let path = dir.path().join("config");
        std::fs::create_dir(&path).unwrap();
        let err = upsert_host_block(&path, &block(1)).await.unwrap_err();
        assert!(matches!(err, SessionError::ConfigWriteFailure { .. }));
    }

    #[tokio::test]
    async fn remove_block_keeps_other_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "Host a\n  User x\n\nHost cml\n  Port 1\n\nHost b\n  User y\n").unwrap();

        assert_eq!(remove_host_block(&path, "cml").await.unwrap(), 1);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "Host a\n  User x\n\nHost b\n  User y\n"
        );
        assert_eq!(remove_host_block(&path, "cml").await.unwrap(), 0);
    }
}
