//! Input resolution: path or URL → [`DocumentSource`].
//!
//! URLs are downloaded into a `TempDir` that lives inside
//! [`ResolvedInput`], so cleanup happens when it is dropped. The format is
//! decided by magic bytes, never by extension alone:
//!
//! | leading bytes      | format                                   |
//! |--------------------|------------------------------------------|
//! | `PK\x03\x04`       | DOCX (zip container)                     |
//! | `{` (after spaces) | JSON layout file ([`DocumentSource`])    |
//! | `%PDF`             | raw PDF: needs an extracted layout file  |
//! | `D0 CF 11 E0`      | legacy `.doc`: unsupported               |
//! | anything else      | plain text, if named `.txt` / `.md`      |

use crate::document::DocumentSource;
use crate::error::CaseGenError;
use crate::pipeline::{docx, text};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// The resolved input: either a local path or a downloaded temp file.
pub enum ResolvedInput {
    /// Input was already a local file.
    Local(PathBuf),
    /// Input was a URL; the document was downloaded to a temp directory.
    /// The `TempDir` is kept alive to prevent cleanup until processing completes.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    /// Get the path to the document regardless of how it was resolved.
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

/// Container formats recognised by [`sniff_format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Docx,
    Layout,
    Pdf,
    LegacyDoc,
    /// `.txt` / `.md`: decoded and split into one paragraph per line.
    Text,
    Unknown,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Classify document bytes by their leading bytes.
pub fn sniff_format(bytes: &[u8], path: &Path) -> InputFormat {
    if bytes.starts_with(b"PK\x03\x04") {
        return InputFormat::Docx;
    }
    if bytes.starts_with(b"%PDF") {
        return InputFormat::Pdf;
    }
    if bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
        return InputFormat::LegacyDoc;
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if matches!(ext.as_str(), "txt" | "md" | "markdown") {
        return InputFormat::Text;
    }
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let first = body.iter().find(|b| !b.is_ascii_whitespace());
    if first == Some(&b'{') || ext == "json" {
        return InputFormat::Layout;
    }
    InputFormat::Unknown
}

/// Resolve, read and parse `input` into a document.
pub async fn load_document(input: &str, timeout_secs: u64) -> Result<DocumentSource, CaseGenError> {
    let resolved = resolve_input(input, timeout_secs).await?;
    let path = resolved.path();
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => CaseGenError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => CaseGenError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;
    parse_document(&bytes, path)
}

/// Parse document bytes already in memory.
pub fn parse_document(bytes: &[u8], path: &Path) -> Result<DocumentSource, CaseGenError> {
    let format = sniff_format(bytes, path);
    debug!("Sniffed {} as {:?}", path.display(), format);
    match format {
        InputFormat::Docx => Ok(DocumentSource::Flow(docx::read_docx(bytes, path)?)),
        InputFormat::Layout => {
            let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
            serde_json::from_slice(body).map_err(|e| CaseGenError::InvalidLayout {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
        }
        InputFormat::Text => Ok(DocumentSource::Flow(text::read_text(bytes))),
        InputFormat::Pdf => Err(CaseGenError::UnsupportedFormat {
            path: path.to_path_buf(),
            detail: "raw PDF input needs a layout file: export positioned characters and \
                     images per page as JSON ({\"format\": \"paged\", \"pages\": [...]})"
                .into(),
        }),
        InputFormat::LegacyDoc => Err(CaseGenError::UnsupportedFormat {
            path: path.to_path_buf(),
            detail: "legacy .doc files are not supported; save the document as .docx".into(),
        }),
        InputFormat::Unknown => {
            let magic: Vec<String> = bytes.iter().take(4).map(|b| format!("{b:02X}")).collect();
            Err(CaseGenError::UnsupportedFormat {
                path: path.to_path_buf(),
                detail: format!("unrecognised leading bytes [{}]", magic.join(" ")),
            })
        }
    }
}

/// Resolve the input string to a local file path.
///
/// If the input is a URL, download it to a temporary directory.
/// If the input is a local file, validate it exists and is readable.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, CaseGenError> {
    if input.trim().is_empty() {
        return Err(CaseGenError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(input)
    }
}

fn resolve_local(path_str: &str) -> Result<ResolvedInput, CaseGenError> {
    let path = PathBuf::from(path_str);

    if !path.is_file() {
        return Err(CaseGenError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(CaseGenError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(CaseGenError::FileNotFound { path });
        }
    }

    debug!("Resolved local document: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

/// Download a URL to a temporary directory and return the path.
async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, CaseGenError> {
    info!("Downloading document from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| CaseGenError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let timeout_or_failure = |e: reqwest::Error| {
        if e.is_timeout() {
            CaseGenError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            CaseGenError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let response = client.get(url).send().await.map_err(timeout_or_failure)?;

    if !response.status().is_success() {
        return Err(CaseGenError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let filename = extract_filename(url);
    let temp_dir = TempDir::new().map_err(|e| CaseGenError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);

    let bytes = response.bytes().await.map_err(timeout_or_failure)?;

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| CaseGenError::Internal(format!("Failed to write temp file: {}", e)))?;

    info!("Downloaded {} bytes to: {}", bytes.len(), file_path.display());

    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL when it looks like a file name.
fn extract_filename(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    "downloaded".to_string()
}
