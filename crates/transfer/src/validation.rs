use std::path::{Component, Path};

use crate::TransferError;

/// Validates a client-supplied upload filename.
///
/// The name is metadata only (backing files are keyed by session id), but
/// it must still be a single plain path component.
///
/// Rejects:
/// - Empty names
/// - Path separators (`/` or `\`)
/// - NUL bytes
/// - `.` and `..`
/// - Anything that parses as absolute or carries a Windows prefix
pub fn validate_filename(filename: &str) -> Result<(), TransferError> {
    if filename.is_empty() {
        return Err(TransferError::InvalidFilename("empty filename".into()));
    }

    if filename.contains('\0') {
        return Err(TransferError::InvalidFilename(
            "filename contains NUL".into(),
        ));
    }

    if filename.contains(['/', '\\']) {
        return Err(TransferError::InvalidFilename(format!(
            "path separators not allowed: {filename}"
        )));
    }

    let mut components = Path::new(filename).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::InvalidFilename(format!(
            "not a plain file name: {filename}"
        ))),
    }
}
