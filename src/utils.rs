//! Utility functions for file names, content types and disk space

use std::path::Path;

/// Longest file extension we carry over from a source name
const MAX_EXTENSION_LEN: usize = 10;

/// Stem used when a URL has no usable file name
const FALLBACK_STEM: &str = "asset";

/// Last path segment of a URL, percent-decoded
///
/// Returns `None` for unparseable URLs and for paths ending in `/`.
///
/// ```
/// use media_relay::utils::url_file_name;
///
/// assert_eq!(
///     url_file_name("https://example.com/docs/Lecture%201.pdf").as_deref(),
///     Some("Lecture 1.pdf")
/// );
/// assert_eq!(url_file_name("https://example.com/"), None);
/// ```
pub fn url_file_name(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last.to_string());
    Some(decoded)
}

/// Parse a file name out of a `Content-Disposition` header value
///
/// Handles both `filename="file.pdf"` and the RFC 5987 form
/// `filename*=UTF-8''file%20name.pdf`.
pub fn content_disposition_file_name(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(encoded) = part.strip_prefix("filename*=") {
            // charset'lang'encoded-filename
            if let Some(idx) = encoded.rfind('\'')
                && let Ok(decoded) = urlencoding::decode(&encoded[idx + 1..])
            {
                return Some(decoded.into_owned());
            }
        } else if let Some(name) = part.strip_prefix("filename=") {
            let name = name.trim_matches('"');
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Pick the file name of a fetched source
///
/// The URL path wins when it carries an extension, otherwise the response's
/// `Content-Disposition` is consulted, then the bare URL segment.
pub fn extract_filename_from_response(response: &reqwest::Response, url: &str) -> Option<String> {
    let from_url = url_file_name(url);
    if from_url
        .as_deref()
        .and_then(file_extension)
        .is_some()
    {
        return from_url;
    }

    response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(content_disposition_file_name)
        .or(from_url)
}

/// Lowercase extension of a file name, if it looks like one
///
/// Only short alphanumeric extensions are returned so the value is always
/// safe to splice into scratch file names and object keys.
pub fn file_extension(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?;
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Make a string safe for use inside a file name or object key
///
/// Keeps `[A-Za-z0-9._-]`, maps everything else to `_`, and never returns an
/// empty string or one starting with a dot.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c == '_');
    if trimmed.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Sanitized file stem of a URL's last path segment
///
/// ```
/// use media_relay::utils::url_stem;
///
/// assert_eq!(url_stem("https://example.com/a/Lecture%201.pdf"), "Lecture_1");
/// assert_eq!(url_stem("https://www.youtube.com/watch?v=abc"), "watch");
/// assert_eq!(url_stem("not a url"), "asset");
/// ```
pub fn url_stem(url: &str) -> String {
    url_file_name(url)
        .and_then(|name| {
            Path::new(&name)
                .file_stem()
                .and_then(|s| s.to_str())
                .map(sanitize_component)
        })
        .unwrap_or_else(|| FALLBACK_STEM.to_string())
}

/// Best-effort MIME type for a file extension
pub fn content_type_for_extension(extension: Option<&str>) -> &'static str {
    let Some(ext) = extension else {
        return "application/octet-stream";
    };
    match ext.to_ascii_lowercase().as_str() {
        "pdf" => "application/pdf",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "json" => "application/json",
        "txt" => "text/plain",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Last `max_bytes` of `bytes` as text, decoded lossily
///
/// Used to keep the interesting end of a tool's diagnostic output.
pub fn tail_lossy(bytes: &[u8], max_bytes: usize) -> String {
    let start = bytes.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

/// Get available disk space for a given path
///
/// Uses platform-specific APIs to query filesystem statistics:
/// - Linux: statvfs
/// - macOS: statvfs
/// - Windows: GetDiskFreeSpaceExW
///
/// # Examples
///
/// ```ignore
/// let available = get_available_space(Path::new("./scratch"))?;
/// println!("Available space: {} GB", available / (1024 * 1024 * 1024));
/// ```
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string, stat is zeroed before
        // the call and only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // f_bavail: blocks available to unprivileged users
            #[allow(clippy::unnecessary_cast)]
            let available_bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
            Ok(available_bytes)
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated and every out pointer refers to a
        // live, aligned u64 that is only read after a successful call.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut _total_bytes: u64 = 0;
            let mut _total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut _total_bytes as *mut u64 as *mut _,
                &mut _total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Disk space checking is not supported on this platform",
        ))
    }
}
