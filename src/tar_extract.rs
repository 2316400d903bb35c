//! Tar extractor (component C): gunzip + hand-rolled ustar/pax/GNU-long-name
//! decoder with path-traversal defenses. The teacher calls the `tar` crate's
//! `Archive::entries()` directly; spec.md §4.C requires explicit, testable
//! control over PAX/GNU header promotion and the `package/`-prefix-stripping +
//! `..`-rejection discipline, so this module decodes the tar format itself,
//! keeping only `flate2::read::GzDecoder` from the teacher for the gunzip step.

use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

const BLOCK_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum TarError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("truncated tar header")]
    Truncated,
    #[error("path traversal rejected: {0}")]
    PathTraversal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryType {
    File,
    Directory,
    Symlink,
    PaxExtended,
    PaxGlobal,
    GnuLongName,
    Other,
}

struct RawEntry {
    name: String,
    size: u64,
    entry_type: EntryType,
    link_name: String,
    data_start: usize,
}

fn parse_octal(bytes: &[u8]) -> u64 {
    let s = String::from_utf8_lossy(bytes);
    let trimmed = s.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if trimmed.is_empty() {
        return 0;
    }
    u64::from_str_radix(trimmed, 8).unwrap_or(0)
}

fn parse_size(bytes: &[u8]) -> u64 {
    if bytes[0] & 0x80 != 0 {
        // base-256 encoding: high bit of first byte is set
        let mut value: u64 = (bytes[0] & 0x7f) as u64;
        for &b in &bytes[1..] {
            value = (value << 8) | b as u64;
        }
        value
    } else {
        parse_octal(bytes)
    }
}

fn cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn is_zero_block(block: &[u8]) -> bool {
    block.iter().all(|&b| b == 0)
}

fn parse_header(block: &[u8]) -> RawEntry {
    let name = cstr(&block[0..100]);
    let size = parse_size(&block[124..136]);
    let typeflag = block[156];
    let link_name = cstr(&block[157..257]);
    let magic = &block[257..263];
    let prefix = if magic == b"ustar\0" || &block[257..265] == b"ustar  \0" {
        cstr(&block[345..500])
    } else {
        String::new()
    };

    let full_name = if prefix.is_empty() {
        name
    } else {
        format!("{prefix}/{name}")
    };

    let entry_type = match typeflag {
        b'0' | b'\0' => EntryType::File,
        b'5' => EntryType::Directory,
        b'2' => EntryType::Symlink,
        b'x' | b'X' => EntryType::PaxExtended,
        b'g' => EntryType::PaxGlobal,
        b'L' => EntryType::GnuLongName,
        _ => EntryType::Other,
    };

    RawEntry {
        name: full_name,
        size,
        entry_type,
        link_name,
        data_start: 0,
    }
}

/// Parses a PAX extended-header body (`key=value\n` records, length-prefixed)
/// looking for a `path=` override.
fn pax_path_override(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    for line in text.split('\n') {
        if let Some(rest) = line.splitn(2, ' ').nth(1)
            && let Some(value) = rest.strip_prefix("path=")
        {
            return Some(value.to_string());
        }
    }
    None
}

fn blocks_for_size(size: u64) -> usize {
    ((size as usize) + BLOCK_SIZE - 1) / BLOCK_SIZE
}

/// Strips the leading path component (npm tarballs wrap content in `package/`)
/// and rejects any path containing `..` segments.
fn sanitize_relative_path(raw: &str) -> Result<PathBuf, TarError> {
    let path = Path::new(raw);
    let mut components = path.components();
    components.next(); // drop the wrapping `package/` (or whatever top-level dir) component

    let mut out = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(TarError::PathTraversal(raw.to_string())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(TarError::PathTraversal(raw.to_string()));
            }
        }
    }
    Ok(out)
}

/// Gunzips `data` and extracts every regular/directory/symlink entry into `dest`,
/// stripping the tarball's single top-level wrapper directory.
pub fn extract_gz_tarball(data: &[u8], dest: &Path) -> Result<(), TarError> {
    let mut gz = GzDecoder::new(data);
    let mut tar_bytes = Vec::new();
    gz.read_to_end(&mut tar_bytes)?;
    extract_tar(&tar_bytes, dest)
}

pub fn extract_tar(tar_bytes: &[u8], dest: &Path) -> Result<(), TarError> {
    let mut offset = 0usize;
    let mut pending_path_override: Option<String> = None;
    let mut consecutive_zero_blocks = 0;

    while offset + BLOCK_SIZE <= tar_bytes.len() {
        let block = &tar_bytes[offset..offset + BLOCK_SIZE];

        if is_zero_block(block) {
            consecutive_zero_blocks += 1;
            offset += BLOCK_SIZE;
            if consecutive_zero_blocks >= 2 {
                break;
            }
            continue;
        }
        consecutive_zero_blocks = 0;

        if offset + BLOCK_SIZE > tar_bytes.len() {
            return Err(TarError::Truncated);
        }

        let mut entry = parse_header(block);
        offset += BLOCK_SIZE;

        let data_blocks = blocks_for_size(entry.size);
        let data_len = data_blocks * BLOCK_SIZE;
        if offset + data_len > tar_bytes.len() {
            return Err(TarError::Truncated);
        }
        entry.data_start = offset;
        let entry_data = &tar_bytes[offset..offset + entry.size as usize];
        offset += data_len;

        match entry.entry_type {
            EntryType::PaxGlobal => continue,
            EntryType::PaxExtended => {
                pending_path_override = pax_path_override(entry_data);
                continue;
            }
            EntryType::GnuLongName => {
                pending_path_override = Some(cstr(entry_data));
                continue;
            }
            _ => {}
        }

        let effective_name = pending_path_override.take().unwrap_or(entry.name);
        let relative = sanitize_relative_path(&effective_name)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest_path = dest.join(&relative);

        match entry.entry_type {
            EntryType::Directory => {
                fs::create_dir_all(&dest_path)?;
            }
            EntryType::Symlink => {
                if let Some(parent) = dest_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                // Some hosts forbid symlinks; tolerate failure per spec.md §4.C.
                #[cfg(unix)]
                {
                    let _ = std::os::unix::fs::symlink(&entry.link_name, &dest_path);
                }
                #[cfg(not(unix))]
                {
                    let _ = fs::write(&dest_path, entry.link_name.as_bytes());
                }
            }
            EntryType::File => {
                if let Some(parent) = dest_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&dest_path, entry_data)?;
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::tempdir;

    fn pad_block(mut v: Vec<u8>) -> Vec<u8> {
        v.resize(BLOCK_SIZE, 0);
        v
    }

    fn ustar_header(name: &str, size: u64, typeflag: u8) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        let name_bytes = name.as_bytes();
        block[0..name_bytes.len().min(100)].copy_from_slice(&name_bytes[..name_bytes.len().min(100)]);
        let size_oct = format!("{size:011o}\0");
        block[124..124 + size_oct.len()].copy_from_slice(size_oct.as_bytes());
        block[156] = typeflag;
        block[257..263].copy_from_slice(b"ustar\0");
        block
    }

    fn file_entry(name: &str, contents: &[u8]) -> Vec<u8> {
        let mut out = ustar_header(name, contents.len() as u64, b'0');
        out.extend(pad_block(contents.to_vec()));
        out
    }

    fn pax_header_entry(path_override: &str) -> Vec<u8> {
        let record = format!("{} path={}\n", path_override.len() + 7 + path_override.len().to_string().len(), path_override);
        // simplistic PAX record; length field not strictly validated by our parser
        let mut out = ustar_header("PaxHeaders/entry", record.len() as u64, b'x');
        out.extend(pad_block(record.into_bytes()));
        out
    }

    #[test]
    fn extracts_package_prefixed_files() {
        let mut tar = Vec::new();
        tar.extend(file_entry("package/a.txt", b"hi"));
        tar.extend(file_entry("package/b/c.txt", b"x"));
        tar.extend(vec![0u8; BLOCK_SIZE * 2]);

        let dir = tempdir().unwrap();
        extract_tar(&tar, dir.path()).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hi");
        assert_eq!(fs::read_to_string(dir.path().join("b/c.txt")).unwrap(), "x");
    }

    #[test]
    fn rejects_parent_traversal() {
        let tar = file_entry("package/../../etc/passwd", b"oops");
        let dir = tempdir().unwrap();
        let result = extract_tar(&tar, dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn pax_extended_header_overrides_next_name() {
        let mut tar = Vec::new();
        tar.extend(pax_header_entry("package/long/name.txt"));
        tar.extend(file_entry("package/short.txt", b"longcontents"));
        tar.extend(vec![0u8; BLOCK_SIZE * 2]);

        let dir = tempdir().unwrap();
        extract_tar(&tar, dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("long/name.txt")).unwrap(),
            "longcontents"
        );
    }

    #[test]
    fn empty_files_produce_zero_byte_output() {
        let tar = file_entry("package/empty.txt", b"");
        let dir = tempdir().unwrap();
        extract_tar(&tar, dir.path()).unwrap();
        assert_eq!(fs::read(dir.path().join("empty.txt")).unwrap().len(), 0);
    }

    #[test]
    fn extracts_gzipped_input() {
        let mut tar = Vec::new();
        tar.extend(file_entry("package/a.txt", b"hi"));
        tar.extend(vec![0u8; BLOCK_SIZE * 2]);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        let gz = encoder.finish().unwrap();

        let dir = tempdir().unwrap();
        extract_gz_tarball(&gz, dir.path()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hi");
    }
}
