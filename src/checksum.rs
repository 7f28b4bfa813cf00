//! Local file digests, computed the way the depot computes them.
//!
//! The depot digest is an MD5 of the file content with two twists: `utf8`
//! files may carry a BOM on disk that is not part of the recorded content,
//! and `utf16` files are hashed after conversion to UTF-8.

use crate::record::{FileType, FstatRecord};
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

const READ_CHUNK: usize = 1024 * 1024;
const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// Digest of a local file, uppercase hex. Returns `None` if the file does not
/// exist or is a directory.
pub fn file_digest(path: &Path, file_type: FileType, recorded_size: u64) -> io::Result<Option<String>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let meta = file.metadata()?;
    if meta.is_dir() {
        return Ok(None);
    }

    let mut hasher = Md5::new();
    match file_type {
        FileType::Utf16 => {
            let mut raw = Vec::with_capacity(meta.len() as usize);
            file.read_to_end(&mut raw)?;
            hasher.update(decode_utf16(&raw).as_bytes());
        }
        _ => {
            if file_type == FileType::Utf8 && meta.len() > recorded_size {
                let mut bom = [0u8; 3];
                let n = read_up_to(&mut file, &mut bom)?;
                if n < 3 || bom != UTF8_BOM {
                    file.seek(SeekFrom::Start(0))?;
                }
            }
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
    }
    Ok(Some(hex::encode_upper(hasher.finalize())))
}

/// Digest of an in-memory buffer, uppercase hex.
pub fn content_digest(content: &[u8]) -> String {
    hex::encode_upper(Md5::digest(content))
}

/// Whether the local file under `root` already matches `record`.
///
/// Deletes match when nothing (or a directory) is at the path. Symlinks match
/// when the link exists. A record without a digest matches any existing file.
pub fn matches_local(root: &Path, record: &FstatRecord) -> io::Result<bool> {
    let path = record.local_path(root);
    let meta = match std::fs::symlink_metadata(&path) {
        Ok(m) => m,
        Err(e) if is_absent(&e) => return Ok(record.is_delete()),
        Err(e) => return Err(e),
    };

    if record.is_delete() {
        return Ok(meta.is_dir());
    }
    if record.file_type == FileType::Symlink {
        return Ok(meta.file_type().is_symlink());
    }
    if meta.is_dir() {
        return Ok(false);
    }
    if record.digest.is_empty() {
        return Ok(true);
    }

    let local = file_digest(&path, record.file_type, record.size)?;
    Ok(local
        .map(|d| d.eq_ignore_ascii_case(&record.digest))
        .unwrap_or(false))
}

/// Nothing can be at a path whose parent is missing or is not a directory.
fn is_absent(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
    )
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Decode UTF-16 with BOM detection, little-endian when there is no BOM.
pub(crate) fn decode_utf16(raw: &[u8]) -> String {
    let (big_endian, body) = match raw {
        [0xFE, 0xFF, rest @ ..] => (true, rest),
        [0xFF, 0xFE, rest @ ..] => (false, rest),
        _ => (false, raw),
    };
    let units = body.chunks_exact(2).map(|pair| {
        if big_endian {
            u16::from_be_bytes([pair[0], pair[1]])
        } else {
            u16::from_le_bytes([pair[0], pair[1]])
        }
    });
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}
