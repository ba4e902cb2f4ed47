// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::error::CollectError;

pub async fn exists(entry: impl AsRef<Path>) -> Result<bool> {
    use tokio::io::ErrorKind::NotFound;

    let metadata = fs::metadata(entry).await;

    if let Err(err) = &metadata {
        if err.kind() == NotFound {
            return Ok(false);
        }
    }

    // Return an error if it was anything other than `NotFound`.
    metadata?;

    Ok(true)
}

async fn list_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("unable to list directory: {}", dir.display()))?;

    let mut paths = vec![];
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    paths.sort();

    Ok(paths)
}

/// Find the instrumented build root inside an unpacked archive.
///
/// Archives wrap the build tree in an unpredictable number of directories.
/// Descend while a level holds exactly one subdirectory and stop at the first
/// level with several entries, or whose only entry is a file.
pub async fn find_build_root(dir: impl AsRef<Path>) -> Result<PathBuf> {
    let mut current = dir.as_ref().to_path_buf();

    loop {
        let entries = list_entries(&current).await?;

        match entries.as_slice() {
            [] => {
                return Err(CollectError::EmptyArtifact { path: current }.into());
            }
            [only] => {
                if !fs::metadata(only).await?.is_dir() {
                    return Ok(current);
                }
                current = only.clone();
            }
            _ => return Ok(current),
        }
    }
}

/// Delete every file called `name` anywhere below `root`.
pub async fn remove_files_named(root: impl AsRef<Path>, name: &str) -> Result<usize> {
    let mut removed = 0;
    let mut pending = vec![root.as_ref().to_path_buf()];

    while let Some(dir) = pending.pop() {
        for path in list_entries(&dir).await? {
            let file_type = fs::symlink_metadata(&path).await?.file_type();

            if file_type.is_dir() {
                pending.push(path);
            } else if path.file_name().map_or(false, |n| n == name) {
                fs::remove_file(&path)
                    .await
                    .with_context(|| format!("unable to remove {}", path.display()))?;
                removed += 1;
            }
        }
    }

    Ok(removed)
}

/// Atomically move a finished file into its final location.
pub async fn persist(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
    let (from, to) = (from.as_ref(), to.as_ref());

    if fs::rename(from, to).await.is_err() {
        // `rename` cannot cross filesystems. Stage a copy next to the target
        // so the final step is still a rename.
        let staged = to.with_extension("staged");
        fs::copy(from, &staged).await.with_context(|| {
            format!("unable to copy {} to {}", from.display(), staged.display())
        })?;
        fs::rename(&staged, to)
            .await
            .with_context(|| format!("unable to move into place: {}", to.display()))?;
        fs::remove_file(from).await?;
    }

    Ok(())
}
