//! Build metadata embedded by `build.rs`.

use std::fmt;

use serde::Serialize;

/// Package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

const UNKNOWN: &str = "unknown";

macro_rules! build_env {
    ($name:literal) => {
        match option_env!($name) {
            Some(value) => value,
            None => UNKNOWN,
        }
    };
}

/// Where and from what this binary was built.
///
/// Fields read "unknown" when built outside a git checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub branch: &'static str,
    pub sha: &'static str,
    pub dirty: bool,
    pub built_at: &'static str,
    pub target: &'static str,
    pub debug: bool,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: PKG_VERSION,
            branch: build_env!("VERGEN_GIT_BRANCH"),
            sha: build_env!("VERGEN_GIT_SHA"),
            dirty: matches!(option_env!("VERGEN_GIT_DIRTY"), Some("true")),
            built_at: build_env!("VERGEN_BUILD_TIMESTAMP"),
            target: build_env!("VERGEN_CARGO_TARGET_TRIPLE"),
            debug: matches!(option_env!("VERGEN_CARGO_DEBUG"), Some("true")),
        }
    }

    /// First seven characters of the commit SHA.
    pub fn short_sha(&self) -> &'static str {
        &self.sha[..7.min(self.sha.len())]
    }
}

/// `{version}+{branch}.{sha}`, plus `.dirty` for a modified tree.
impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}.{}", self.version, self.branch, self.short_sha())?;
        if self.dirty {
            f.write_str(".dirty")?;
        }
        Ok(())
    }
}

/// Version string of the running build.
pub fn version_string() -> String {
    BuildInfo::current().to_string()
}
