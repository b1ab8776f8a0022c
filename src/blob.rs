use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};

/// File-backed blob store rooted at `{workspace}/files`. Paths are
/// slash-delimited and relative; anything that could escape the root is
/// rejected before touching the filesystem.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(workspace: &Path) -> Self {
        BlobStore {
            root: workspace.join("files"),
        }
    }

    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        if path.trim().is_empty() {
            return Err(anyhow!("blob path is empty"));
        }
        if path.starts_with('/') || path.contains('\\') {
            return Err(anyhow!("blob path must be relative: {}", path));
        }
        let mut out = self.root.clone();
        for segment in path.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(anyhow!("blob path segment not allowed: {}", path));
            }
            out.push(segment);
        }
        Ok(out)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn get(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let full = self.resolve(path)?;
        std::fs::read(&full).with_context(|| format!("failed to read blob {}", path))
    }

    pub fn put(&self, path: &str, bytes: &[u8], overwrite: bool) -> anyhow::Result<()> {
        let full = self.resolve(path)?;
        if !overwrite && full.exists() {
            return Err(anyhow!("blob already exists: {}", path));
        }
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create blob directory for {}", path))?;
        }
        std::fs::write(&full, bytes).with_context(|| format!("failed to write blob {}", path))
    }

    pub fn delete(&self, path: &str) -> anyhow::Result<()> {
        let full = self.resolve(path)?;
        std::fs::remove_file(&full).with_context(|| format!("failed to delete blob {}", path))
    }

    /// Moves a blob to its archive location, creating parents as needed.
    pub fn archive(&self, path: &str) -> anyhow::Result<String> {
        let archived = archive_path(path);
        let from = self.resolve(path)?;
        let to = self.resolve(&archived)?;
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create archive directory for {}", path))?;
        }
        std::fs::rename(&from, &to)
            .with_context(|| format!("failed to move blob {} to archive", path))?;
        Ok(archived)
    }
}

pub fn archive_path(path: &str) -> String {
    format!("archive/{}", path)
}

/// Department sheets get a fresh blob per upload; common (shared) subjects
/// use a deterministic path keyed by subject and term so repeated uploads
/// merge into one file.
pub fn sheet_path(
    department_id: Option<&str>,
    subject_id: &str,
    year: &str,
    batch: &str,
    upload_id: &str,
) -> String {
    let slug = |s: &str| {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>()
    };
    match department_id {
        Some(dept) => format!("sheets/{}/{}.xlsx", slug(dept), upload_id),
        None => format!(
            "sheets/common/{}-{}-{}.xlsx",
            slug(subject_id),
            slug(year),
            slug(batch)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_store() -> BlobStore {
        let p = std::env::temp_dir().join(format!(
            "examhall-blob-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        BlobStore::new(&p)
    }

    #[test]
    fn put_get_delete_cycle() {
        let store = temp_store();
        store.put("sheets/d1/a.xlsx", b"abc", false).expect("put");
        assert!(store.exists("sheets/d1/a.xlsx"));
        assert_eq!(store.get("sheets/d1/a.xlsx").expect("get"), b"abc");
        store.delete("sheets/d1/a.xlsx").expect("delete");
        assert!(!store.exists("sheets/d1/a.xlsx"));
    }

    #[test]
    fn put_without_overwrite_rejects_existing() {
        let store = temp_store();
        store.put("a.xlsx", b"one", false).expect("put");
        assert!(store.put("a.xlsx", b"two", false).is_err());
        store.put("a.xlsx", b"two", true).expect("overwrite");
        assert_eq!(store.get("a.xlsx").expect("get"), b"two");
    }

    #[test]
    fn traversal_segments_are_rejected() {
        let store = temp_store();
        assert!(store.get("../outside").is_err());
        assert!(store.get("/etc/passwd").is_err());
        assert!(store.put("a/../b", b"x", true).is_err());
    }

    #[test]
    fn archive_moves_the_blob() {
        let store = temp_store();
        store.put("sheets/d1/a.xlsx", b"abc", false).expect("put");
        let archived = store.archive("sheets/d1/a.xlsx").expect("archive");
        assert_eq!(archived, "archive/sheets/d1/a.xlsx");
        assert!(!store.exists("sheets/d1/a.xlsx"));
        assert_eq!(store.get(&archived).expect("get"), b"abc");
    }

    #[test]
    fn common_subject_path_is_deterministic() {
        let a = sheet_path(None, "sub-1", "2024 Odd Sem", "VI", "ignored");
        let b = sheet_path(None, "sub-1", "2024 Odd Sem", "VI", "other");
        assert_eq!(a, b);
        let dept = sheet_path(Some("d1"), "sub-1", "2024 Odd Sem", "VI", "u1");
        assert_eq!(dept, "sheets/d1/u1.xlsx");
    }
}
