use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ComposeError;

/// Find `file_name` in `start` or the closest ancestor that contains it and return the
/// joined path. Relative starting points are resolved against the process working
/// directory first so the walk can reach the filesystem root.
pub fn locate_compose_file(file_name: &str, start: &Path) -> Result<PathBuf, ComposeError> {
    let start = if start.is_absolute() {
        start.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|err| ComposeError::io("failed to read current directory", err))?
            .join(start)
    };

    let found = start
        .ancestors()
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file());

    match found {
        Some(path) => {
            debug!(path = %path.display(), "resolved compose file");
            Ok(path)
        }
        None => Err(ComposeError::ComposeFileNotFound {
            name: file_name.to_string(),
            searched_from: start,
        }),
    }
}
