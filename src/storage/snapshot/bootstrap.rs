use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::Context;

use super::id::RESERVED_FILE_NAMES;

/// Copy function for [`copy_for_bootstrap`](super::FileBasedSnapshotStore::copy_for_bootstrap)
/// that copies every regular file of the source snapshot except `excluded`.
pub fn copy_all_except<I, S>(
    excluded: I,
) -> impl Fn(&Path, &Path) -> anyhow::Result<()> + Send + Sync + 'static
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let excluded: HashSet<String> = excluded.into_iter().map(Into::into).collect();

    move |source: &Path, target: &Path| {
        fs::create_dir_all(target)
            .with_context(|| format!("Failed to create bootstrap directory {:?}", target))?;

        let entries = fs::read_dir(source)
            .with_context(|| format!("Failed to list snapshot directory {:?}", source))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            if excluded.contains(&name) || RESERVED_FILE_NAMES.contains(&name.as_str()) {
                continue;
            }

            fs::copy(entry.path(), target.join(&name))
                .with_context(|| format!("Failed to copy {:?}", entry.path()))?;
        }
        Ok(())
    }
}
