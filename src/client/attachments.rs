//! Attachment files: validation, the `attachmentData` descriptor and packing.
//!
//! Several files travel as one byte string. The descriptor
//! `"<name> <size>, <name> <size>"` records the order and length of each one,
//! which is all that is needed to split them again.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{ClientError, Result};

const SEPARATOR: &str = ", ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub data: Vec<u8>,
}

/// A name is `<stem>.<ext>`, both non-empty, and nothing else.
pub fn validate_name(name: &str) -> Result<()> {
    let parts: Vec<&str> = name.split('.').collect();
    let well_formed = parts.len() == 2 && parts.iter().all(|p| !p.is_empty());
    let plain = !name.contains(['/', '\\', ',', ' ']);
    if well_formed && plain {
        Ok(())
    } else {
        Err(ClientError::Attachment(format!(
            "File {} does not have a valid name.",
            name
        )))
    }
}

/// Read attachment files from disk.
pub fn read_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Attachment>> {
    paths.iter().map(|p| read_file(p.as_ref())).collect()
}

fn read_file(path: &Path) -> Result<Attachment> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ClientError::Attachment(format!("Invalid path: {}", path.display())))?;
    validate_name(name)?;
    if !path.is_file() {
        return Err(ClientError::Attachment(format!(
            "File {} does not exist or is a directory.",
            path.display()
        )));
    }
    Ok(Attachment {
        name: name.to_string(),
        data: fs::read(path)?,
    })
}

pub fn descriptor(files: &[Attachment]) -> String {
    files
        .iter()
        .map(|f| format!("{} {}", f.name, f.data.len()))
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

/// Descriptor and concatenated contents.
pub fn pack(files: &[Attachment]) -> (String, Vec<u8>) {
    let bytes = files.iter().flat_map(|f| f.data.iter().copied()).collect();
    (descriptor(files), bytes)
}

/// Split packed bytes back into files according to `descriptor`.
pub fn unpack(descriptor: &str, bytes: &[u8]) -> Result<Vec<Attachment>> {
    if descriptor.is_empty() {
        return if bytes.is_empty() {
            Ok(Vec::new())
        } else {
            Err(ClientError::Attachment(
                "Attachment bytes without a descriptor".to_string(),
            ))
        };
    }

    let mut files = Vec::new();
    let mut offset = 0usize;
    for entry in descriptor.split(SEPARATOR) {
        let (name, size) = entry
            .rsplit_once(' ')
            .ok_or_else(|| ClientError::Attachment(format!("Malformed descriptor entry: {}", entry)))?;
        validate_name(name)?;
        let size: usize = size
            .parse()
            .map_err(|_| ClientError::Attachment(format!("Invalid size in entry: {}", entry)))?;
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                ClientError::Attachment("Descriptor exceeds attachment bytes".to_string())
            })?;
        files.push(Attachment {
            name: name.to_string(),
            data: bytes[offset..end].to_vec(),
        });
        offset = end;
    }
    if offset != bytes.len() {
        return Err(ClientError::Attachment(
            "Attachment bytes exceed descriptor".to_string(),
        ));
    }
    Ok(files)
}

/// Write received files into `dir`, replacing existing files of the same name.
pub fn write_files(dir: &Path, files: &[Attachment]) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        validate_name(&file.name)?;
        let path = dir.join(&file.name);
        if path.is_dir() {
            return Err(ClientError::Attachment(format!(
                "Invalid destination for file: {}",
                path.display()
            )));
        }
        fs::write(&path, &file.data)?;
        debug!("Wrote attachment {}", path.display());
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_names() {
        assert!(validate_name("report.pdf").is_ok());
        assert!(validate_name("report").is_err());
        assert!(validate_name(".pdf").is_err());
        assert!(validate_name("archive.tar.gz").is_err());
        assert!(validate_name("../x.txt").is_err());
    }

    #[test]
    fn test_pack_and_unpack() {
        let files = vec![
            Attachment {
                name: "a.txt".to_string(),
                data: b"hello".to_vec(),
            },
            Attachment {
                name: "b.bin".to_string(),
                data: vec![0, 1, 2],
            },
        ];
        let (descriptor, bytes) = pack(&files);
        assert_eq!(descriptor, "a.txt 5, b.bin 3");
        assert_eq!(bytes.len(), 8);
        assert_eq!(unpack(&descriptor, &bytes).unwrap(), files);

        assert!(unpack(&descriptor, &bytes[..7]).is_err());
        assert!(unpack("a.txt 5", &bytes).is_err());
        assert!(unpack("", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_read_and_write_files() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("note.txt");
        fs::write(&source, b"contents").unwrap();

        let files = read_files(&[&source]).unwrap();
        assert_eq!(files[0].name, "note.txt");
        assert!(read_files(&[dir.path().join("missing.txt")]).is_err());
        assert!(read_files(&[dir.path()]).is_err());

        let out = dir.path().join("received");
        let written = write_files(&out, &files).unwrap();
        assert_eq!(fs::read(&written[0]).unwrap(), b"contents");
        write_files(&out, &files).unwrap();
    }
}
