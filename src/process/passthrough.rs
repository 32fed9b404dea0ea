//! Passthrough processing for assets that need no transformation

use crate::config::Profile;
use crate::error::ProcessError;
use crate::scratch::artifact_extension;
use crate::types::{FetchResult, FormatMetadata, ProcessResult, WorkItem};
use crate::utils::content_type_for_extension;

/// Hand the fetched file on as the artifact
///
/// The file stays where the fetcher put it; no copy is made. The content type
/// comes from the profile, then from the source response, then from the
/// extension.
pub async fn passthrough(
    item: &WorkItem,
    profile: &Profile,
    fetched: &FetchResult,
) -> Result<ProcessResult, ProcessError> {
    let extension = artifact_extension(&fetched.local_path);

    if !profile.accepts_extension(extension.as_deref()) {
        return Err(ProcessError::UnsupportedFormat {
            profile: item.profile.clone(),
            reason: format!(
                "input extension {} not accepted",
                extension.as_deref().unwrap_or("(none)")
            ),
        });
    }

    let metadata = tokio::fs::metadata(&fetched.local_path)
        .await
        .map_err(|source| ProcessError::Io {
            path: fetched.local_path.clone(),
            source,
        })?;
    if metadata.len() == 0 {
        return Err(ProcessError::NonZeroExit {
            tool: "passthrough".to_string(),
            code: None,
            stderr: "fetched source is empty".to_string(),
        });
    }

    let content_type = profile
        .content_type
        .clone()
        .or_else(|| {
            fetched
                .content_type
                .as_deref()
                .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
                .filter(|ct| !ct.is_empty() && ct != "application/octet-stream")
        })
        .unwrap_or_else(|| content_type_for_extension(extension.as_deref()).to_string());

    Ok(ProcessResult {
        output_path: fetched.local_path.clone(),
        format: FormatMetadata {
            profile: item.profile.clone(),
            extension: extension.unwrap_or_else(|| "bin".to_string()),
            content_type,
            size_bytes: metadata.len(),
        },
    })
}
