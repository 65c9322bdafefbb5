//! Verification of the `sha256sum.txt` manifest at the root of an artifact.

use std::io::{BufReader, Read};

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use openssl::hash::{Hasher, MessageDigest};

use crate::error::ImageError;

/// Name of the checksum manifest.
pub(crate) const MANIFEST: &str = "sha256sum.txt";

/// One manifest line.
#[derive(Debug, PartialEq, Eq)]
struct ManifestEntry<'a> {
    digest: &'a str,
    path: &'a str,
}

/// Parse `sha256sum` output: a hex digest, a space, then ` ` (text mode) or
/// `*` (binary mode) and the path.
fn parse_manifest(s: &str) -> Result<Vec<ManifestEntry<'_>>> {
    s.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let (digest, rest) = l
                .split_once(' ')
                .ok_or_else(|| anyhow::anyhow!("Malformed checksum line: {l}"))?;
            anyhow::ensure!(
                digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()),
                "Malformed checksum line: {l}"
            );
            let path = rest
                .strip_prefix(' ')
                .or_else(|| rest.strip_prefix('*'))
                .unwrap_or(rest);
            Ok(ManifestEntry { digest, path })
        })
        .collect()
}

/// The SHA-256 of `path` as lowercase hex.
fn sha256_file(path: &Utf8Path) -> Result<String> {
    let f = std::fs::File::open(path).with_context(|| format!("Opening {path}"))?;
    let mut reader = BufReader::new(f);
    let mut hasher = Hasher::new(MessageDigest::sha256())?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n])?;
    }
    Ok(hex::encode(hasher.finish()?))
}

/// Check every file listed in the manifest below `root`.
///
/// A missing manifest is [`ImageError::ImproperImage`]; a missing or
/// differing file is [`ImageError::ChecksumMismatch`].
#[context("Validating image checksums")]
pub(crate) fn verify_manifest(root: &Utf8Path) -> Result<()> {
    let manifest = root.join(MANIFEST);
    if !manifest.try_exists()? {
        return Err(ImageError::ImproperImage.into());
    }
    let contents = std::fs::read_to_string(&manifest)?;
    let entries = parse_manifest(&contents)?;
    for entry in entries {
        let rel = entry.path.strip_prefix("./").unwrap_or(entry.path);
        let path = root.join(rel);
        if !path.is_file() {
            return Err(ImageError::ChecksumMismatch(rel.to_owned()).into());
        }
        let actual = sha256_file(&path)?;
        if !actual.eq_ignore_ascii_case(entry.digest) {
            tracing::debug!("{rel}: expected {}, found {actual}", entry.digest);
            return Err(ImageError::ChecksumMismatch(rel.to_owned()).into());
        }
    }
    Ok(())
}

/// Write a manifest covering `files` below `root`.
#[cfg(test)]
pub(crate) fn write_manifest(root: &Utf8Path, files: &[&str]) {
    let s: String = files
        .iter()
        .map(|f| format!("{}  ./{f}\n", sha256_file(&root.join(f)).unwrap()))
        .collect();
    std::fs::write(root.join(MANIFEST), s).unwrap();
}
