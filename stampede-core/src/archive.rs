use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read as _;

use crate::error::LoadError;
use crate::options::Options;

const MANIFEST_PATH: &str = "manifest.json";
const FILES_PREFIX: &str = "files/";

/// A sealed, deterministic bundle of a script and its reachable resources.
/// On disk it is a tar stream: `manifest.json` at the root declares the
/// runner type, the entry filename and the sealed options; every other entry
/// lives under `files/`.
#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    pub archive_type: String,
    pub filename: String,
    pub options: Options,
    pub files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    #[serde(rename = "type")]
    archive_type: String,
    filename: String,
    options: Options,
}

impl Archive {
    pub fn new(archive_type: &str, filename: &str, options: Options) -> Archive {
        Archive {
            archive_type: archive_type.to_string(),
            filename: filename.to_string(),
            options,
            files: BTreeMap::new(),
        }
    }

    /// The entry script's bytes, if the bundle contains them.
    pub fn entry_data(&self) -> Option<&[u8]> {
        self.files.get(&self.filename).map(|v| v.as_slice())
    }

    pub fn read(data: &[u8]) -> Result<Archive, LoadError> {
        let mut tar = tar::Archive::new(data);
        let mut manifest: Option<Manifest> = None;
        let mut files = BTreeMap::new();

        let entries = tar
            .entries()
            .map_err(|e| LoadError::Archive(e.to_string()))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| LoadError::Archive(e.to_string()))?;
            let path = entry
                .path()
                .map_err(|e| LoadError::Archive(e.to_string()))?
                .to_string_lossy()
                .to_string();

            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| LoadError::Archive(e.to_string()))?;

            if path == MANIFEST_PATH {
                manifest = Some(
                    serde_json::from_slice(&data)
                        .map_err(|e| LoadError::Archive(format!("bad manifest: {e}")))?,
                );
            } else if let Some(rel) = path.strip_prefix(FILES_PREFIX) {
                files.insert(rel.to_string(), data);
            }
        }

        let manifest = manifest
            .ok_or_else(|| LoadError::Archive(format!("missing {MANIFEST_PATH}")))?;

        Ok(Archive {
            archive_type: manifest.archive_type,
            filename: manifest.filename,
            options: manifest.options,
            files,
        })
    }

    /// Serializes the bundle. Entry order, modes and timestamps are fixed so
    /// the same archive always produces the same bytes.
    pub fn write(&self) -> std::io::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());

        let manifest = Manifest {
            archive_type: self.archive_type.clone(),
            filename: self.filename.clone(),
            options: self.options.clone(),
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        append_entry(&mut builder, MANIFEST_PATH, &manifest_json)?;

        for (path, data) in &self.files {
            append_entry(&mut builder, &format!("{FILES_PREFIX}{path}"), data)?;
        }

        builder.into_inner()
    }
}

fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, path, data)
}

/// Source type auto-detection: a tar stream is recognized by its first
/// header parsing cleanly.
pub fn looks_like_archive(data: &[u8]) -> bool {
    let mut tar = tar::Archive::new(data);
    match tar.entries() {
        Ok(mut entries) => matches!(entries.next(), Some(Ok(_))),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_archive() -> Archive {
        let mut archive = Archive::new(
            "lua",
            "script.lua",
            Options {
                vus: Some(10),
                duration: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        );
        archive
            .files
            .insert("script.lua".to_string(), b"-- entry".to_vec());
        archive
            .files
            .insert("lib/util.lua".to_string(), b"return {}".to_vec());
        archive
    }

    #[test]
    fn round_trip_is_byte_equal() {
        let archive = sample_archive();
        let bytes = archive.write().unwrap_or_else(|e| panic!("{e}"));
        let parsed = Archive::read(&bytes).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(parsed, archive);

        let bytes_again = parsed.write().unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(bytes, bytes_again);
    }

    #[test]
    fn entry_data_points_at_the_declared_filename() {
        let archive = sample_archive();
        assert_eq!(archive.entry_data(), Some(b"-- entry".as_slice()));
    }

    #[test]
    fn detection_accepts_tar_and_rejects_scripts() {
        let archive = sample_archive();
        let bytes = archive.write().unwrap_or_else(|e| panic!("{e}"));
        assert!(looks_like_archive(&bytes));
        assert!(!looks_like_archive(b"local x = 1\nreturn x"));
        assert!(!looks_like_archive(b""));
    }

    #[test]
    fn missing_manifest_is_rejected() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_mtime(0);
        builder
            .append_data(&mut header, "files/x", b"abc".as_slice())
            .unwrap_or_else(|e| panic!("{e}"));
        let bytes = builder.into_inner().unwrap_or_else(|e| panic!("{e}"));

        let err = Archive::read(&bytes).expect_err("expected archive error");
        assert!(matches!(err, LoadError::Archive(_)));
    }
}
