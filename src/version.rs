//! Build identification
//!
//! Every node reports the same build string in `version` output and in its
//! `REGISTER` message, so mismatched binaries in a cluster are easy to spot.

use std::fmt;

use serde::Serialize;

use crate::protocol::PROTOCOL_VERSION;

/// Build metadata embedded by `build.rs`
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub git_hash: &'static str,
    pub git_branch: &'static str,
    #[serde(skip)]
    git_dirty_str: &'static str,
    pub build_timestamp: &'static str,
    pub target: &'static str,
    pub host: &'static str,
    pub profile: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            git_hash: env!("WORKER_COMMS_GIT_HASH"),
            git_branch: env!("WORKER_COMMS_GIT_BRANCH"),
            git_dirty_str: env!("WORKER_COMMS_GIT_DIRTY"),
            build_timestamp: env!("WORKER_COMMS_BUILD_TIMESTAMP"),
            target: env!("WORKER_COMMS_TARGET"),
            host: env!("WORKER_COMMS_HOST"),
            profile: env!("WORKER_COMMS_PROFILE"),
            rustc_version: env!("WORKER_COMMS_RUSTC_VERSION"),
        }
    }

    pub fn git_dirty(&self) -> bool {
        self.git_dirty_str == "true"
    }

    /// "0.1.0-abc1234", with "-dirty" appended for uncommitted builds
    pub fn full_version(&self) -> String {
        let dirty = if self.git_dirty() { "-dirty" } else { "" };
        format!("{}-{}{}", self.version, self.git_hash, dirty)
    }

    pub fn is_release(&self) -> bool {
        self.profile == "release"
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "  Protocol:   {}", PROTOCOL_VERSION)?;
        writeln!(f, "  Git:        {} ({})", self.git_hash, self.git_branch)?;
        writeln!(f, "  Built:      {} [{}]", self.build_timestamp, self.profile)?;
        writeln!(f, "  Target:     {}", self.target)?;
        writeln!(f, "  Host:       {}", self.host)?;
        writeln!(f, "  Compiler:   {}", self.rustc_version)
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::current()
}

/// Print build information to stdout, as text or JSON
pub fn print_version(json: bool) -> crate::error::Result<()> {
    let info = build_info();
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        print!("{}", info);
    }
    Ok(())
}
