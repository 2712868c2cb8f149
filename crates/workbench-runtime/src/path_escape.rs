//! Host path escaping for bind mount specs.

use serde::{Deserialize, Serialize};

/// Path convention of the host that owns the project folders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathConvention {
    #[default]
    Unix,
    Windows,
}

impl PathConvention {
    /// Convention of the machine this process runs on.
    pub fn current() -> Self {
        if cfg!(windows) {
            PathConvention::Windows
        } else {
            PathConvention::Unix
        }
    }

    pub fn escape(self, path: &str) -> String {
        match self {
            PathConvention::Unix => path.to_string(),
            PathConvention::Windows => escape_path(path),
        }
    }
}

impl std::str::FromStr for PathConvention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unix" | "linux" | "macos" => Ok(PathConvention::Unix),
            "windows" => Ok(PathConvention::Windows),
            other => Err(format!("unknown path convention '{other}'")),
        }
    }
}

/// Converts a Windows host path into the form the daemon accepts in a mount spec.
///
/// Only a drive letter colon is removed; later colons separate host and container paths
/// and are kept. The drive letter is lowercased, backslashes become slashes, and the
/// result starts with exactly one `/`.
pub fn escape_path(path: &str) -> String {
    let mut escaped = if path.find(':') == Some(1) {
        let mut chars = path.chars();
        let drive = chars.next().map(|c| c.to_ascii_lowercase());
        let rest = chars.as_str().replacen(':', "", 1);
        drive.into_iter().collect::<String>() + &rest
    } else {
        path.to_string()
    };
    escaped = escaped.replace('\\', "/");

    let trimmed = escaped.trim_start_matches('/');
    format!("/{trimmed}")
}
