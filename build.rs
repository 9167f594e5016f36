use std::process::Command;

/// Short commit hash from git, or `GIT_SHA` when building outside a checkout
fn commit() -> Option<String> {
    let from_git = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string());

    from_git
        .or_else(|| std::env::var("GIT_SHA").ok())
        .filter(|sha| !sha.is_empty())
}

fn main() {
    let base = env!("CARGO_PKG_VERSION");

    // Release builds report the plain crate version; dev builds carry the commit
    let release = std::env::var("HELIOS_RELEASE").is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let version = match (release, commit()) {
        (false, Some(sha)) => format!("{base}-dev+{sha}"),
        _ => base.to_string(),
    };

    println!("cargo:rustc-env=APP_VERSION={version}");
    println!("cargo:rerun-if-env-changed=HELIOS_RELEASE");
    println!("cargo:rerun-if-env-changed=GIT_SHA");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
