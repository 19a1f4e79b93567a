//! Whole-file snapshot writes shared by the persisted stores.

use std::path::{Path, PathBuf};

use tokio::fs;

/// Replace `path` with `body` via a sibling temp file and rename, creating
/// parent directories as needed. Readers see the old or the new document,
/// never a partial one.
pub async fn write_replacing(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/doc.json");

        write_replacing(&path, b"first").await.unwrap();
        write_replacing(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!dir.path().join("state/doc.json.tmp").exists());
    }
}
