use std::path::Path;

use sha2::{Digest, Sha256};

/// A stable, file-name safe identifier for the project rooted at `dir`.
///
/// The directory name keeps it readable, the hash of the full path keeps two checkouts with the
/// same name apart.
pub fn project_id(dir: &Path) -> String {
    let absolute = std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf());

    let name: String = absolute
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = if name.is_empty() { "root".into() } else { name };

    let hash = Sha256::digest(absolute.to_string_lossy().as_bytes());
    let hash: String = hash[..4].iter().map(|b| format!("{b:02x}")).collect();

    format!("{name}-{hash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id() {
        let id = project_id(Path::new("/home/user/src/gnome builder"));
        let (name, hash) = id.rsplit_once('-').unwrap();
        assert_eq!(name, "gnome_builder");
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_same_name_different_paths() {
        let a = project_id(Path::new("/a/project"));
        let b = project_id(Path::new("/b/project"));
        assert_ne!(a, b);
        assert!(a.starts_with("project-"));
        assert_eq!(a, project_id(Path::new("/a/project")));
    }

    #[test]
    fn test_root() {
        assert!(project_id(Path::new("/")).starts_with("root-"));
    }
}
