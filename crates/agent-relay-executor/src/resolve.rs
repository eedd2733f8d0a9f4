//! Executable lookup for provider CLIs.

use std::{
    collections::HashSet,
    env::{join_paths, split_paths},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::{process::Command, sync::OnceCell};

const PATH_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

static LOGIN_SHELL_PATH: OnceCell<Option<OsString>> = OnceCell::const_new();

/// Resolve an executable by name, falling back to the login shell's PATH.
///
/// The search order is:
/// 1. Explicit paths (absolute or containing a separator).
/// 2. The current process PATH via `which`.
/// 3. The PATH a login shell reports, merged with the current one.
///
/// Processes started from a desktop launcher often miss the user's shell
/// PATH additions, which is where npm-installed CLIs usually live.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() || path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    if let Some(found) = which_async(executable, None).await {
        return Some(found);
    }

    let refreshed = LOGIN_SHELL_PATH
        .get_or_init(|| async {
            let fresh = login_shell_path().await?;
            let existing = std::env::var_os("PATH").unwrap_or_default();
            let merged = merge_paths(&existing, &fresh);
            if merged == existing {
                None
            } else {
                tracing::debug!(?existing, ?merged, "Using login shell PATH for lookups");
                Some(merged)
            }
        })
        .await
        .clone()?;

    which_async(executable, Some(refreshed)).await
}

/// Merge two PATH strings into a single, de-duplicated PATH.
#[must_use]
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let mut merged = Vec::<PathBuf>::new();

    for p in split_paths(primary.as_ref()).chain(split_paths(secondary.as_ref())) {
        if !p.as_os_str().is_empty() && seen.insert(p.clone()) {
            merged.push(p);
        }
    }

    join_paths(merged).unwrap_or_default()
}

async fn which_async(executable: &str, paths: Option<OsString>) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || match paths {
        Some(paths) => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            which::which_in(executable, Some(paths), cwd)
        }
        None => which::which(executable),
    })
    .await
    .ok()
    .and_then(Result::ok)
}

#[cfg(not(windows))]
async fn login_shell_path() -> Option<OsString> {
    let shell = std::env::var_os("SHELL")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute() && p.is_file())
        .unwrap_or_else(|| PathBuf::from("/bin/sh"));
    let login = matches!(
        shell.file_name().and_then(OsStr::to_str),
        Some("zsh" | "bash")
    );

    let mut cmd = Command::new(&shell);
    if login {
        cmd.arg("-l");
    }
    cmd.arg("-c")
        .arg("printf '%s' \"$PATH\"")
        .env("TERM", "dumb")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = cmd.spawn().ok()?;
    let output = match tokio::time::timeout(PATH_REFRESH_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            tracing::debug!(
                shell = %shell.display(),
                ?err,
                "Failed to retrieve PATH from login shell"
            );
            return None;
        }
        Err(_) => {
            tracing::warn!(shell = %shell.display(), "Timed out retrieving PATH from login shell");
            return None;
        }
    };

    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8(output.stdout).ok()?.trim().to_string();
    if path.is_empty() {
        None
    } else {
        Some(OsString::from(path))
    }
}

#[cfg(windows)]
async fn login_shell_path() -> Option<OsString> {
    None
}
