use std::{
    collections::BTreeSet,
    env,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

/// Ordered list of directories searched for executables.
///
/// Built once at startup and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathTable {
    dirs: Vec<PathBuf>,
}

impl PathTable {
    /// Parses a colon-separated search path; empty entries are dropped.
    pub fn from_search_path(search_path: impl AsRef<OsStr>) -> Self {
        let dirs = env::split_paths(search_path.as_ref())
            .filter(|dir| !dir.as_os_str().is_empty())
            .collect();
        Self { dirs }
    }

    pub fn from_env() -> Self {
        match env::var_os("PATH") {
            Some(path) => Self::from_search_path(path),
            None => {
                debug!("PATH is not set, command lookup will always fail");
                Self::default()
            }
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        resolve(name, &self.dirs)
    }

    /// Every distinct entry name across the table that starts with `prefix`.
    pub fn candidates(&self, prefix: &str) -> BTreeSet<String> {
        self.dirs
            .iter()
            .filter_map(|dir| fs::read_dir(dir).ok())
            .flat_map(|entries| entries.flatten())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| name.starts_with(prefix))
            .collect()
    }
}

/// Finds the first directory in `dirs` holding an entry named exactly `name`.
///
/// Directories that cannot be opened count as "no match". Names containing a
/// slash are treated as paths and bypass the search.
pub fn resolve<P: AsRef<Path>>(name: &str, dirs: &[P]) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }

    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.exists().then_some(path);
    }

    dirs.iter()
        .map(AsRef::as_ref)
        .find(|dir| contains_entry(dir, name))
        .map(|dir| dir.join(name))
}

fn contains_entry(dir: &Path, name: &str) -> bool {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), "skipping search directory: {e}");
            return false;
        }
    };

    entries.flatten().any(|entry| entry.file_name() == name)
}
