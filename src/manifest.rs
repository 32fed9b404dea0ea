//! Manifest parsing
//!
//! A manifest lists the assets to relay. Two formats are accepted:
//!
//! - JSON: an array of entries, or an object with an `items` array
//! - CSV: a header row `source_url,destination[,profile,sha256,size,id,source]`
//!
//! Entries become [`WorkItem`]s via [`Manifest::into_work_items`], which
//! resolves profiles, derives ids and drops duplicates.

use crate::config::ProcessingConfig;
use crate::error::{Error, Result};
use crate::types::{SourceKind, WorkItem, WorkItemId};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

/// One manifest row
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    /// Source URL
    #[serde(alias = "source_url")]
    pub url: String,

    /// Destination key prefix (ending in `/`) or exact key
    pub destination: String,

    /// Processing profile (default from config)
    #[serde(default)]
    pub profile: Option<String>,

    /// Expected SHA-256 of the source
    #[serde(default)]
    pub sha256: Option<String>,

    /// Expected source size in bytes
    #[serde(default)]
    pub size: Option<u64>,

    /// Explicit item id
    #[serde(default)]
    pub id: Option<String>,

    /// Fetch strategy
    #[serde(default)]
    pub source: Option<SourceKind>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonManifest {
    List(Vec<ManifestEntry>),
    Wrapped { items: Vec<ManifestEntry> },
}

/// Parsed manifest
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    /// Entries in file order
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Load a manifest file; `.csv` files are read as CSV, everything else as JSON
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Manifest(format!("cannot read {}: {e}", path.display())))?;

        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));

        let manifest = if is_csv {
            Self::from_csv(&contents)?
        } else {
            Self::from_json(&contents)?
        };
        debug!(path = ?path, entries = manifest.entries.len(), "loaded manifest");
        Ok(manifest)
    }

    /// Parse a JSON manifest
    pub fn from_json(contents: &str) -> Result<Self> {
        let parsed: JsonManifest = serde_json::from_str(contents)
            .map_err(|e| Error::Manifest(format!("invalid JSON manifest: {e}")))?;
        let entries = match parsed {
            JsonManifest::List(entries) | JsonManifest::Wrapped { items: entries } => entries,
        };
        Ok(Self { entries })
    }

    /// Parse a CSV manifest with a header row
    pub fn from_csv(contents: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(contents.as_bytes());

        let mut entries = Vec::new();
        for (index, record) in reader.deserialize::<ManifestEntry>().enumerate() {
            // header is line 1
            let entry = record.map_err(|e| {
                Error::Manifest(format!("CSV manifest line {}: {e}", index + 2))
            })?;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Turn entries into pending work items
    ///
    /// Fails on an empty manifest, an unknown profile, a bad checksum or id,
    /// or an empty destination. Entries that map to an id already seen are
    /// dropped with a warning.
    pub fn into_work_items(self, processing: &ProcessingConfig) -> Result<Vec<WorkItem>> {
        if self.entries.is_empty() {
            return Err(Error::Manifest("manifest contains no entries".to_string()));
        }

        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(self.entries.len());

        for (index, entry) in self.entries.into_iter().enumerate() {
            let position = index + 1;
            let url = entry.url.trim().to_string();
            let destination = entry.destination.trim().to_string();

            if destination.is_empty() {
                return Err(Error::Manifest(format!(
                    "entry {position} ({url}): destination is empty"
                )));
            }

            let profile = entry
                .profile
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| processing.default_profile.clone());
            if processing.resolve_profile(&profile).is_none() {
                return Err(Error::Manifest(format!(
                    "entry {position} ({url}): unknown profile '{profile}'"
                )));
            }

            let expected_sha256 = match entry.sha256.filter(|s| !s.trim().is_empty()) {
                Some(sum) => {
                    let sum = sum.trim().to_ascii_lowercase();
                    if sum.len() != 64 || !sum.chars().all(|c| c.is_ascii_hexdigit()) {
                        return Err(Error::Manifest(format!(
                            "entry {position} ({url}): sha256 must be 64 hex characters"
                        )));
                    }
                    Some(sum)
                }
                None => None,
            };

            let id = match entry.id.filter(|s| !s.trim().is_empty()) {
                Some(explicit) => WorkItemId::explicit(explicit.trim())
                    .map_err(|e| Error::Manifest(format!("entry {position}: {e}")))?,
                None => WorkItemId::derive(&url, &destination, &profile),
            };

            if !seen.insert(id.clone()) {
                warn!(item_id = %id, url = %url, entry = position, "duplicate manifest entry dropped");
                continue;
            }

            let mut item = WorkItem::new(id, url, destination, profile);
            item.expected_sha256 = expected_sha256;
            item.expected_size = entry.size;
            item.source_kind = entry.source.unwrap_or_default();
            items.push(item);
        }

        Ok(items)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SUM: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn json_array_and_wrapped_forms() {
        let list = Manifest::from_json(
            r#"[{"url": "https://example.com/a.pdf", "destination": "pdfs/"}]"#,
        )
        .unwrap();
        let wrapped = Manifest::from_json(
            r#"{"items": [{"url": "https://example.com/a.pdf", "destination": "pdfs/"}]}"#,
        )
        .unwrap();

        assert_eq!(list.entries, wrapped.entries);
        assert_eq!(list.entries[0].destination, "pdfs/");
    }

    #[test]
    fn csv_with_optional_columns() {
        let csv = format!(
            "source_url,destination,profile,sha256,size,id,source\n\
             https://example.com/a.pdf,pdfs/,,{SUM},4,,\n\
             https://www.youtube.com/watch?v=x,videos/,mp4-h264,,,talk-1,yt-dlp\n"
        );
        let manifest = Manifest::from_csv(&csv).unwrap();

        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.entries[0].profile, None);
        assert_eq!(manifest.entries[0].size, Some(4));
        assert_eq!(manifest.entries[1].id.as_deref(), Some("talk-1"));
        assert_eq!(manifest.entries[1].source, Some(SourceKind::YtDlp));
    }

    #[test]
    fn csv_with_only_required_columns() {
        let manifest =
            Manifest::from_csv("source_url,destination\nhttps://example.com/s.pptx,slides/\n")
                .unwrap();
        assert_eq!(manifest.entries[0].url, "https://example.com/s.pptx");
    }

    #[test]
    fn csv_error_names_the_line() {
        let err = Manifest::from_csv("source_url,destination,size\nhttps://a/b,x/,big\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("line 2"), "{err}");
    }

    #[test]
    fn load_picks_format_from_extension() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "source_url,destination").unwrap();
        writeln!(file, "https://example.com/a.pdf,pdfs/").unwrap();

        let manifest = Manifest::load(file.path()).unwrap();
        assert_eq!(manifest.entries.len(), 1);
    }

    #[test]
    fn work_items_get_default_profile_and_stable_ids() {
        let processing = ProcessingConfig::default();
        let manifest = Manifest::from_json(&format!(
            r#"[{{"url": "https://example.com/a.pdf", "destination": "pdfs/", "sha256": "{}"}}]"#,
            SUM.to_uppercase()
        ))
        .unwrap();

        let items = manifest.clone().into_work_items(&processing).unwrap();
        let again = manifest.into_work_items(&processing).unwrap();

        assert_eq!(items[0].profile, "passthrough");
        assert_eq!(items[0].expected_sha256.as_deref(), Some(SUM));
        assert_eq!(items[0].id, again[0].id);
        assert_eq!(
            items[0].id,
            WorkItemId::derive("https://example.com/a.pdf", "pdfs/", "passthrough")
        );
    }

    #[test]
    fn duplicates_are_dropped() {
        let processing = ProcessingConfig::default();
        let manifest = Manifest::from_json(
            r#"[
                {"url": "https://example.com/a.pdf", "destination": "pdfs/"},
                {"url": "https://example.com/b.pdf", "destination": "pdfs/"},
                {"url": "https://example.com/a.pdf", "destination": "pdfs/"}
            ]"#,
        )
        .unwrap();

        let items = manifest.into_work_items(&processing).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn empty_manifest_is_an_error() {
        let processing = ProcessingConfig::default();
        let err = Manifest::from_json("[]")
            .unwrap()
            .into_work_items(&processing)
            .unwrap_err();
        assert!(matches!(err, Error::Manifest(_)));
    }

    #[test]
    fn unknown_profile_and_bad_checksum_are_rejected() {
        let processing = ProcessingConfig::default();

        let unknown = Manifest::from_json(
            r#"[{"url": "https://example.com/a", "destination": "x/", "profile": "nope"}]"#,
        )
        .unwrap();
        assert!(unknown.into_work_items(&processing).is_err());

        let bad_sum = Manifest::from_json(
            r#"[{"url": "https://example.com/a", "destination": "x/", "sha256": "abc"}]"#,
        )
        .unwrap();
        assert!(bad_sum.into_work_items(&processing).is_err());
    }

    #[test]
    fn malformed_url_is_accepted_here_and_fails_later() {
        let processing = ProcessingConfig::default();
        let items = Manifest::from_json(r#"[{"url": "not a url", "destination": "pdfs/"}]"#)
            .unwrap()
            .into_work_items(&processing)
            .unwrap();
        assert_eq!(items[0].source_url, "not a url");
    }
}
