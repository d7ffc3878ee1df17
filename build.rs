//! Build script for worker-comms
//!
//! Embeds git revision, build timestamp, target and profile so that
//! `worker-comms version` can report exactly which build is running on
//! each node of a cluster.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = run("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_branch = run("git", &["rev-parse", "--abbrev-ref", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(output) if output.status.success() => {
            if output.stdout.is_empty() { "false" } else { "true" }
        }
        _ => "unknown",
    };

    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let host = env::var("HOST").unwrap_or_else(|_| "unknown".to_string());
    let rustc_version = run("rustc", &["--version"]);

    let vars = [
        ("WORKER_COMMS_GIT_HASH", git_hash.as_str()),
        ("WORKER_COMMS_GIT_BRANCH", git_branch.as_str()),
        ("WORKER_COMMS_GIT_DIRTY", git_dirty),
        ("WORKER_COMMS_BUILD_TIMESTAMP", build_timestamp.as_str()),
        ("WORKER_COMMS_TARGET", target.as_str()),
        ("WORKER_COMMS_PROFILE", profile.as_str()),
        ("WORKER_COMMS_RUSTC_VERSION", rustc_version.as_str()),
        ("WORKER_COMMS_HOST", host.as_str()),
    ];
    for (key, value) in vars {
        println!("cargo:rustc-env={}={}", key, value);
    }
}

/// Run a command and return its trimmed stdout, or "unknown" on any failure
fn run(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
