//! Local agent bundle: file listing and content stamp

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Name of the remote file recording which bundle is installed
pub const STAMP_FILE: &str = ".bundle-sha256";

/// One file of the bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    pub path: PathBuf,
    /// Path relative to the bundle root, `/`-separated
    pub relative: String,
}

/// The files to upload plus their combined hash
#[derive(Debug, Clone)]
pub struct Bundle {
    pub root: PathBuf,
    pub files: Vec<BundleFile>,
    pub stamp: String,
}

impl Bundle {
    /// Scan `root`, skipping directories named in `exclude` (dependency caches)
    pub fn scan(root: &Path, exclude: &[String]) -> std::io::Result<Self> {
        let mut files = Vec::new();
        walk(root, root, exclude, &mut files)?;
        files.sort_by(|a, b| a.relative.cmp(&b.relative));

        let mut hasher = Sha256::new();
        for file in &files {
            let content = std::fs::read(&file.path)?;
            hasher.update(file.relative.as_bytes());
            hasher.update([0u8]);
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(&content);
        }

        Ok(Self {
            root: root.to_path_buf(),
            files,
            stamp: hex::encode(hasher.finalize()),
        })
    }

    pub fn contains(&self, relative: &str) -> bool {
        self.files.iter().any(|f| f.relative == relative)
    }
}

fn walk(
    root: &Path,
    dir: &Path,
    exclude: &[String],
    files: &mut Vec<BundleFile>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if exclude.iter().any(|e| *e == name) {
                tracing::debug!("Skipping {}", path.display());
                continue;
            }
            walk(root, &path, exclude, files)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(path.as_path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(BundleFile { path, relative });
        }
    }
    Ok(())
}
