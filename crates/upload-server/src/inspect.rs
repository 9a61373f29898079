use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;

/// Lists the distinct top-level entries of a ZIP archive.
///
/// `dir/a.txt` and `dir/b.txt` both report as `dir/`.
pub fn top_level_entries(path: &Path) -> zip::result::ZipResult<Vec<String>> {
    let archive = zip::ZipArchive::new(File::open(path)?)?;
    let entries: BTreeSet<String> = archive
        .file_names()
        .filter_map(|name| {
            let trimmed = name.trim_start_matches('/');
            match trimmed.split_once('/') {
                Some((dir, _)) if !dir.is_empty() => Some(format!("{dir}/")),
                Some(_) => None,
                None if trimmed.is_empty() => None,
                None => Some(trimmed.to_string()),
            }
        })
        .collect();
    Ok(entries.into_iter().collect())
}
