use std::process::Command;

/// Trimmed stdout of a git command, if it ran
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
}

fn main() {
    let git_hash = git(&["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let build_time = chrono::Utc::now().to_rfc3339();

    println!("cargo:rustc-env=VMGATE_GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=VMGATE_BUILD_TIME={}", build_time);

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");
}
