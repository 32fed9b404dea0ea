//! Scratch storage for intermediate artifacts
//!
//! Every file the pipeline writes lives directly under the scratch root and is
//! named `<item id>.<role>[.<ext>][.part]`, where role is `src` (fetched
//! source) or `out` (processed artifact). Names derive only from the item id,
//! so concurrent items never collide and a crashed run's leftovers can be
//! recognised and swept on the next start.

use crate::types::WorkItemId;
use crate::utils::get_available_space;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Suffix of files still being written
pub const PART_SUFFIX: &str = "part";

const SOURCE_ROLE: &str = "src";
const OUTPUT_ROLE: &str = "out";

/// Summary of a sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Files removed
    pub files_removed: usize,
    /// Bytes reclaimed
    pub bytes_reclaimed: u64,
}

/// Handle to the scratch directory
#[derive(Clone, Debug)]
pub struct ScratchDir {
    root: PathBuf,
}

impl ScratchDir {
    /// Open the scratch directory, creating it if needed
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Scratch root
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Where a source download is written while in progress
    pub fn source_part_path(&self, id: &WorkItemId, extension: Option<&str>) -> PathBuf {
        let mut name = self.file_name(id, SOURCE_ROLE, extension);
        name.push('.');
        name.push_str(PART_SUFFIX);
        self.root.join(name)
    }

    /// Final location of a fetched source
    pub fn source_path(&self, id: &WorkItemId, extension: Option<&str>) -> PathBuf {
        self.root.join(self.file_name(id, SOURCE_ROLE, extension))
    }

    /// Output template handed to yt-dlp, which fills in the extension itself
    pub fn ytdlp_template(&self, id: &WorkItemId) -> PathBuf {
        self.root.join(format!("{id}.{SOURCE_ROLE}.%(ext)s"))
    }

    /// Location of a processed artifact
    pub fn output_path(&self, id: &WorkItemId, extension: Option<&str>) -> PathBuf {
        self.root.join(self.file_name(id, OUTPUT_ROLE, extension))
    }

    fn file_name(&self, id: &WorkItemId, role: &str, extension: Option<&str>) -> String {
        match extension {
            Some(ext) => format!("{id}.{role}.{ext}"),
            None => format!("{id}.{role}"),
        }
    }

    /// Find the fetched source of an item, whatever extension it ended up with
    pub async fn find_source(&self, id: &WorkItemId) -> std::io::Result<Option<PathBuf>> {
        let prefix = format!("{id}.{SOURCE_ROLE}");
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let matches = name == prefix
                || (name.starts_with(&format!("{prefix}."))
                    && !name.ends_with(&format!(".{PART_SUFFIX}")));
            if matches && entry.file_type().await?.is_file() {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    /// Remove every scratch file belonging to an item
    ///
    /// Errors are logged and skipped; returns how many files were removed.
    pub async fn remove_item_files(&self, id: &WorkItemId) -> usize {
        let prefix = format!("{id}.");
        let mut removed = 0;

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(item_id = %id, error = %e, "cannot list scratch directory");
                return 0;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(item_id = %id, error = %e, "error reading scratch directory");
                    break;
                }
            };
            let name = entry.file_name();
            let owned = name
                .to_str()
                .is_some_and(|n| n.starts_with(&prefix) && parse_scratch_name(n).is_some());
            if !owned {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!(item_id = %id, path = ?entry.path(), "removed scratch file");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(item_id = %id, path = ?entry.path(), error = %e, "failed to remove scratch file");
                }
            }
        }

        removed
    }

    /// Remove orphaned scratch files left behind by an earlier run
    ///
    /// Only files following the scratch naming scheme are touched; anything
    /// else in the directory is left alone.
    pub async fn sweep(&self) -> std::io::Result<SweepStats> {
        let mut stats = SweepStats::default();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if parse_scratch_name(name).is_none() {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    stats.files_removed += 1;
                    stats.bytes_reclaimed += metadata.len();
                }
                Err(e) => {
                    warn!(path = ?entry.path(), error = %e, "failed to remove orphaned scratch file");
                }
            }
        }

        if stats.files_removed > 0 {
            info!(
                files = stats.files_removed,
                bytes = stats.bytes_reclaimed,
                scratch = ?self.root,
                "swept orphaned scratch files"
            );
        }
        Ok(stats)
    }

    /// Free space on the scratch filesystem
    pub fn available_space(&self) -> std::io::Result<u64> {
        get_available_space(&self.root)
    }
}

/// Extension of a scratch artifact (`<id>.<role>.<ext>`), if it has one
pub fn artifact_extension(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let mut parts = name.splitn(3, '.');
    parts.next()?;
    parts.next()?;
    let ext = parts.next()?;
    let ext = ext.strip_suffix(&format!(".{PART_SUFFIX}")).unwrap_or(ext);
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Split a scratch file name into (id, role), if it follows the naming scheme
fn parse_scratch_name(name: &str) -> Option<(&str, &str)> {
    let mut parts = name.splitn(3, '.');
    let id = parts.next()?;
    let role = parts.next()?;
    if WorkItemId::explicit(id).is_err() || !matches!(role, SOURCE_ROLE | OUTPUT_ROLE) {
        return None;
    }
    Some((id, role))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(s: &str) -> WorkItemId {
        WorkItemId::explicit(s).unwrap()
    }

    #[tokio::test]
    async fn paths_follow_naming_scheme() {
        let temp = TempDir::new().unwrap();
        let scratch = ScratchDir::open(temp.path()).await.unwrap();
        let item = id("abc123");

        assert_eq!(
            scratch.source_part_path(&item, Some("pdf")),
            temp.path().join("abc123.src.pdf.part")
        );
        assert_eq!(
            scratch.source_path(&item, None),
            temp.path().join("abc123.src")
        );
        assert_eq!(
            scratch.output_path(&item, Some("mp4")),
            temp.path().join("abc123.out.mp4")
        );
        assert_eq!(
            scratch.ytdlp_template(&item),
            temp.path().join("abc123.src.%(ext)s")
        );
    }

    #[tokio::test]
    async fn open_creates_missing_directory() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        let scratch = ScratchDir::open(&nested).await.unwrap();
        assert!(scratch.path().is_dir());
    }

    #[tokio::test]
    async fn find_source_ignores_partial_downloads() {
        let temp = TempDir::new().unwrap();
        let scratch = ScratchDir::open(temp.path()).await.unwrap();
        let item = id("item1");

        std::fs::write(scratch.source_part_path(&item, Some("mp4")), b"x").unwrap();
        assert!(scratch.find_source(&item).await.unwrap().is_none());

        std::fs::write(scratch.source_path(&item, Some("mp4")), b"x").unwrap();
        assert_eq!(
            scratch.find_source(&item).await.unwrap(),
            Some(scratch.source_path(&item, Some("mp4")))
        );
    }

    #[tokio::test]
    async fn remove_item_files_only_touches_that_item() {
        let temp = TempDir::new().unwrap();
        let scratch = ScratchDir::open(temp.path()).await.unwrap();
        let a = id("aaaa");
        let b = id("bbbb");

        std::fs::write(scratch.source_path(&a, Some("pdf")), b"a").unwrap();
        std::fs::write(scratch.output_path(&a, Some("pdf")), b"a").unwrap();
        std::fs::write(scratch.source_path(&b, Some("pdf")), b"b").unwrap();

        assert_eq!(scratch.remove_item_files(&a).await, 2);
        assert!(scratch.source_path(&b, Some("pdf")).exists());
    }

    #[tokio::test]
    async fn sweep_removes_only_scratch_named_files() {
        let temp = TempDir::new().unwrap();
        let scratch = ScratchDir::open(temp.path()).await.unwrap();

        std::fs::write(temp.path().join("0123456789abcdef.src.mp4.part"), b"12345").unwrap();
        std::fs::write(temp.path().join("0123456789abcdef.out.mp4"), b"123").unwrap();
        std::fs::write(temp.path().join("notes.txt"), b"keep me").unwrap();
        std::fs::write(temp.path().join("foo.bar.baz"), b"keep me").unwrap();
        std::fs::create_dir(temp.path().join("abc.src")).unwrap();

        let stats = scratch.sweep().await.unwrap();

        assert_eq!(stats.files_removed, 2);
        assert_eq!(stats.bytes_reclaimed, 8);
        assert!(temp.path().join("notes.txt").exists());
        assert!(temp.path().join("foo.bar.baz").exists());
        assert!(temp.path().join("abc.src").is_dir());
    }

    #[test]
    fn artifact_extension_reads_the_third_segment() {
        assert_eq!(
            artifact_extension(Path::new("/s/abc.src.MP4")).as_deref(),
            Some("mp4")
        );
        assert_eq!(
            artifact_extension(Path::new("abc.src.pdf.part")).as_deref(),
            Some("pdf")
        );
        assert_eq!(artifact_extension(Path::new("abc.src")), None);
    }

    #[test]
    fn scratch_name_parsing() {
        assert_eq!(
            parse_scratch_name("abc.src.pdf.part"),
            Some(("abc", "src"))
        );
        assert_eq!(parse_scratch_name("abc.out"), Some(("abc", "out")));
        assert_eq!(parse_scratch_name("abc.tmp"), None);
        assert_eq!(parse_scratch_name(".hidden.src"), None);
        assert_eq!(parse_scratch_name("plain"), None);
    }
}
