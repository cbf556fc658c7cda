use std::path::{Component, Path};

use crate::FileOpsError;

/// Validates a sender-supplied file name before it touches the save
/// directory.
///
/// Names arrive from the network and must be a single plain path
/// component: no absolute paths, no traversal, no separators, no Windows
/// drive or UNC prefixes.
pub fn validate_file_name(name: &str) -> Result<(), FileOpsError> {
    if name.is_empty() {
        return Err(FileOpsError::InvalidName("empty name".into()));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(FileOpsError::InvalidName(format!(
            "path separator in name: {name}"
        )));
    }

    if name.len() >= 2 && name.as_bytes()[1] == b':' {
        return Err(FileOpsError::InvalidName(format!(
            "Windows drive prefix in name: {name}"
        )));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(FileOpsError::InvalidName(format!("absolute path: {name}")));
    }

    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(FileOpsError::InvalidName(format!(
            "not a plain file name: {name}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_pass() {
        assert!(validate_file_name("photo.jpg").is_ok());
        assert!(validate_file_name("no_extension").is_ok());
        assert!(validate_file_name(".hidden").is_ok());
        assert!(validate_file_name("spaces are fine.txt").is_ok());
    }

    #[test]
    fn empty_rejected() {
        assert!(validate_file_name("").is_err());
    }

    #[test]
    fn separators_rejected() {
        assert!(validate_file_name("a/b.txt").is_err());
        assert!(validate_file_name("a\\b.txt").is_err());
        assert!(validate_file_name("/etc/passwd").is_err());
    }

    #[test]
    fn traversal_rejected() {
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("../x").is_err());
    }

    #[test]
    fn windows_prefixes_rejected() {
        assert!(validate_file_name("C:evil.exe").is_err());
        assert!(validate_file_name("\\\\server\\share").is_err());
    }
}
