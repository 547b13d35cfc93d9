//! Small helpers shared across modules.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Cow::Owned(join_home(&home, path));
        }
    }
    Cow::Borrowed(path)
}

fn join_home(home: &str, path: &str) -> String {
    if path == "~" {
        home.to_string()
    } else {
        format!("{}{}", home, &path[1..])
    }
}

/// `name` in the same directory as `exe`.
pub fn sibling_of(exe: &Path, name: &str) -> PathBuf {
    exe.parent()
        .map_or_else(|| PathBuf::from(name), |dir| dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_joins() {
        assert_eq!(join_home("/home/ana", "~"), "/home/ana");
        assert_eq!(join_home("/home/ana", "~/.ssh/config"), "/home/ana/.ssh/config");
    }

    #[test]
    fn non_tilde_paths_pass_through() {
        assert_eq!(expand_tilde("/etc/ssh/ssh_config"), "/etc/ssh/ssh_config");
        assert_eq!(expand_tilde("~other/x"), "~other/x");
        assert!(matches!(expand_tilde("relative"), Cow::Borrowed(_)));
    }

    #[test]
    fn sibling_binary() {
        assert_eq!(
            sibling_of(Path::new("/usr/local/bin/tether"), "tether-supervisor"),
            PathBuf::from("/usr/local/bin/tether-supervisor")
        );
        assert_eq!(
            sibling_of(Path::new("tether"), "tether-supervisor"),
            PathBuf::from("tether-supervisor")
        );
    }
}
