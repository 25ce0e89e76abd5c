//! Shared path helpers: absolute resolution, bundle names, backup folder names.

use std::env;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};

/// `strftime` layout of the timestamp embedded in backup folder names.
pub const FOLDER_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Resolve a path to an absolute, normalized path.
///
/// If `fs::canonicalize` succeeds (path exists), it is used to resolve symlinks
/// and normalize components. Otherwise the path is made absolute relative to
/// CWD and `..`/`.` components are resolved syntactically.
pub fn resolve_absolute_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    if let Ok(canonical) = std::fs::canonicalize(&absolute) {
        return canonical;
    }

    normalize_syntactic(&absolute)
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}

/// Whether `path`'s final component carries the bundle extension (case-insensitive).
pub fn has_bundle_extension(path: &Path, extension: &str) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy())
        .is_some_and(|name| {
            name.len() > extension.len()
                && name
                    .get(name.len() - extension.len()..)
                    .is_some_and(|tail| tail.eq_ignore_ascii_case(extension))
        })
}

/// Display name of a bundle: the file name without its extension.
pub fn bundle_stem(path: &Path, extension: &str) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if has_bundle_extension(path, extension) {
        name[..name.len() - extension.len()].to_string()
    } else {
        name
    }
}

/// Backup folder name for `now`, e.g. `AppBackup_20240131_093000`.
pub fn timestamped_folder_name<Tz: TimeZone>(prefix: &str, now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{prefix}{}", now.format(FOLDER_TIMESTAMP_FORMAT))
}

/// Name for the `attempt`-th folder created in the same second: the first
/// keeps the plain name, later ones get `-2`, `-3`, ...
pub fn deduplicated_folder_name(base: &str, attempt: u32) -> String {
    if attempt <= 1 {
        base.to_string()
    } else {
        format!("{base}-{attempt}")
    }
}

/// Parse the timestamp out of a backup folder name. `None` if the name does not
/// carry the prefix or the suffix is not a timestamp. A trailing `-N` from
/// [`deduplicated_folder_name`] is ignored.
pub fn parse_folder_timestamp(prefix: &str, name: &str) -> Option<DateTime<Local>> {
    let raw = name.strip_prefix(prefix)?;
    let stamp = match raw.rsplit_once('-') {
        Some((stamp, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => stamp,
        _ => raw,
    };
    let naive = NaiveDateTime::parse_from_str(stamp, FOLDER_TIMESTAMP_FORMAT).ok()?;
    Local.from_local_datetime(&naive).earliest()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_existing_path_canonically() {
        let cwd = env::current_dir().unwrap();
        let resolved = resolve_absolute_path(Path::new("."));
        assert_eq!(resolved, std::fs::canonicalize(&cwd).unwrap());
    }

    #[test]
    fn normalizes_nonexistent_path_syntactically() {
        let input = Path::new("/nonexistent-fus/Volumes/../Backups/AppBackup_1");
        assert!(std::fs::canonicalize(input).is_err());
        assert_eq!(
            resolve_absolute_path(input),
            PathBuf::from("/nonexistent-fus/Backups/AppBackup_1")
        );
    }

    #[test]
    fn bundle_extension_is_case_insensitive() {
        assert!(has_bundle_extension(Path::new("/Applications/Xcode.app"), ".app"));
        assert!(has_bundle_extension(Path::new("/Applications/Odd.APP"), ".app"));
        assert!(!has_bundle_extension(Path::new("/Applications/.app"), ".app"));
        assert!(!has_bundle_extension(Path::new("/Applications/notes.txt"), ".app"));
    }

    #[test]
    fn bundle_stem_strips_extension() {
        assert_eq!(bundle_stem(Path::new("/Applications/Xcode.app"), ".app"), "Xcode");
        assert_eq!(bundle_stem(Path::new("/tmp/plain"), ".app"), "plain");
    }

    #[test]
    fn folder_name_round_trips_timestamp() {
        let now = Local.with_ymd_and_hms(2024, 1, 31, 9, 30, 0).unwrap();
        let name = timestamped_folder_name("AppBackup_", &now);
        assert_eq!(name, "AppBackup_20240131_093000");
        assert_eq!(parse_folder_timestamp("AppBackup_", &name), Some(now));
    }

    #[test]
    fn deduplicated_names_keep_their_timestamp() {
        let now = Local.with_ymd_and_hms(2024, 1, 31, 9, 30, 0).unwrap();
        let base = timestamped_folder_name("AppBackup_", &now);
        assert_eq!(deduplicated_folder_name(&base, 1), base);
        let second = deduplicated_folder_name(&base, 2);
        assert_eq!(second, "AppBackup_20240131_093000-2");
        assert_eq!(parse_folder_timestamp("AppBackup_", &second), Some(now));
        assert!(parse_folder_timestamp("AppBackup_", "AppBackup_20240131_093000-x").is_none());
    }

    #[test]
    fn folder_timestamp_rejects_foreign_names() {
        assert!(parse_folder_timestamp("AppBackup_", "Photos").is_none());
        assert!(parse_folder_timestamp("AppBackup_", "AppBackup_latest").is_none());
    }
}
