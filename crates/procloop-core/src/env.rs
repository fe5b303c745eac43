use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Split explicit `KEY=VALUE` entries into pairs.
///
/// An entry without `=` defines the key with an empty value rather than
/// dropping it. Entries with an empty key are skipped.
pub fn parse_environment<S: AsRef<str>>(entries: &[S]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|entry| {
            let entry = entry.as_ref();
            let (key, value) = entry.split_once('=').unwrap_or((entry, ""));
            if key.is_empty() {
                warn!("skipping environment entry without a key: {entry:?}");
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Resolve `command` to an executable path.
///
/// Commands containing a `/` are taken as paths. Bare names are searched in
/// `PATH`, taken from `env` when an explicit environment defines it and from
/// the parent's environment otherwise.
pub fn find_executable(command: &str, env: Option<&[(String, String)]>) -> Option<PathBuf> {
    if command.is_empty() {
        return None;
    }
    if command.contains('/') {
        let path = PathBuf::from(command);
        return is_executable(&path).then_some(path);
    }

    let search_path: Option<OsString> = env
        .and_then(|vars| vars.iter().find(|(k, _)| k == "PATH"))
        .map(|(_, v)| OsString::from(v))
        .or_else(|| std::env::var_os("PATH"));

    let found = search_path.and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(command))
            .find(|candidate| is_executable(candidate))
    });
    debug!("resolved {command} to {found:?}");
    found
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
