use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

/// Writes `bytes` to a sibling temp file and renames it over `path`, so readers
/// either see the previous contents or the complete new ones.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("failed to replace {}", path.display()));
    }
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Accepts either `sha256:<hex>` or bare hex and returns the prefixed,
/// lowercase form used by [`sha256_bytes`].
pub fn normalize_sha256(digest: &str) -> Result<String> {
    let hex_part = digest.trim().trim_start_matches("sha256:").to_ascii_lowercase();
    if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!("invalid sha256 digest: {}", digest));
    }
    Ok(format!("sha256:{}", hex_part))
}

/// Replaces every line of a flat `key=value` file that starts with
/// `key_prefix` by `new_line`, returning how many lines were replaced.
///
/// Untouched lines are written back byte-for-byte in their original order and
/// each replaced line keeps its original terminator. A key that is not present
/// is not appended.
pub fn update_config_line(path: &Path, key_prefix: &str, new_line: &str) -> Result<usize> {
    let original = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let (patched, replaced) = patch_lines(&original, key_prefix, new_line);
    if replaced > 0 {
        atomic_write_bytes(path, patched.as_bytes())?;
    }
    Ok(replaced)
}

fn patch_lines(text: &str, key_prefix: &str, new_line: &str) -> (String, usize) {
    let mut out = String::with_capacity(text.len() + new_line.len());
    let mut replaced = 0;
    for line in text.split_inclusive('\n') {
        if line.starts_with(key_prefix) {
            let terminator = if line.ends_with("\r\n") {
                "\r\n"
            } else if line.ends_with('\n') {
                "\n"
            } else {
                ""
            };
            out.push_str(new_line);
            out.push_str(terminator);
            replaced += 1;
        } else {
            out.push_str(line);
        }
    }
    (out, replaced)
}

/// Recursively deletes `path`. Returns whether anything was removed.
pub fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
    }
}

/// Byte length of a regular file, `None` when it does not exist.
pub fn file_len(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to stat {}", path.display())),
    }
}
