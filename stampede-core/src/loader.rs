use std::io::Read;
use std::path::Path;

use crate::error::LoadError;
use crate::http::HttpClient;

/// A resolved source reference: exactly the bytes read, plus the canonical
/// filename used downstream for relative-import resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceData {
    pub filename: String,
    pub data: Vec<u8>,
}

/// Resolves a user-provided reference to a [`SourceData`]:
///
/// - `-` reads everything from `stdin`;
/// - an existing filesystem path (joined with `cwd` when relative) is read
///   as-is;
/// - anything that parses as an http(s) URL is fetched remotely;
/// - everything else fails with [`LoadError::NotFound`].
pub async fn read_source(
    reference: &str,
    cwd: &Path,
    stdin: &mut dyn Read,
    client: &HttpClient,
) -> Result<SourceData, LoadError> {
    if reference == "-" {
        let mut data = Vec::new();
        stdin.read_to_end(&mut data).map_err(|source| LoadError::Io {
            reference: "-".to_string(),
            source,
        })?;
        return Ok(SourceData {
            filename: "-".to_string(),
            data,
        });
    }

    let path = Path::new(reference);
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    if resolved.exists() {
        let data = std::fs::read(&resolved).map_err(|source| LoadError::Io {
            reference: reference.to_string(),
            source,
        })?;
        return Ok(SourceData {
            filename: resolved.to_string_lossy().to_string(),
            data,
        });
    }

    if let Ok(parsed) = url::Url::parse(reference)
        && matches!(parsed.scheme(), "http" | "https")
    {
        let response =
            client
                .get(reference)
                .await
                .map_err(|err| LoadError::Remote {
                    reference: reference.to_string(),
                    reason: err.to_string(),
                })?;
        if response.status >= 400 {
            return Err(LoadError::Remote {
                reference: reference.to_string(),
                reason: format!("server responded with status {}", response.status),
            });
        }
        return Ok(SourceData {
            filename: reference.to_string(),
            data: response.body.to_vec(),
        });
    }

    Err(LoadError::NotFound(reference.to_string()))
}
