use crate::ModelError;

/// Checks that an identity is a clean `/`-separated relative path.
///
/// Identities are joined onto the target directory and written into the
/// transfer agent's input file as `out=` values, so each segment must be a
/// plain file or directory name.
pub fn validate_identity(identity: &str) -> Result<(), ModelError> {
    let reject =
        |reason: &str| Err(ModelError::InvalidIdentity(format!("{reason}: {identity:?}")));

    if identity.is_empty() {
        return reject("empty");
    }
    if identity.contains('\0') || identity.contains('\n') || identity.contains('\r') {
        return reject("control character");
    }
    if identity.contains('\\') {
        return reject("backslash separator");
    }
    if identity.starts_with('/') {
        return reject("absolute path");
    }
    // `C:foo` and friends.
    if let [drive, b':', ..] = identity.as_bytes()
        && drive.is_ascii_alphabetic()
    {
        return reject("drive prefix");
    }

    for segment in identity.split('/') {
        match segment {
            "" => return reject("empty path segment"),
            "." | ".." => return reject("relative path segment"),
            _ => {}
        }
    }
    Ok(())
}
