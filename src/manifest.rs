//! Repository manifest.
//!
//! The manifest is a small signed text document published at a well-known
//! location; it names the current root catalog hash, the root path hash, the
//! catalog TTL and the revision. Line format: one record per line, first byte
//! is the field tag, the remainder the value. The signature block after the
//! `--` separator is handed to the [`SignatureVerifier`] as part of the raw
//! text and not interpreted here.

use std::path::Path;
use std::time::Instant;

use crate::download::{Downloader, SignatureVerifier, TransferCounters};
use crate::hash::{ContentHash, PathHash};
use crate::{Error, Result};

pub const MANIFEST_URL_PATH: &str = "/.cvmfspublished";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub root_catalog: ContentHash,
    pub root_path_hash: PathHash,
    pub ttl: u64,
    pub revision: u64,
    pub repository_name: String,
}

impl Manifest {
    pub fn parse(text: &str) -> Result<Self> {
        let mut root_catalog = None;
        let mut root_path_hash = None;
        let mut ttl = 0u64;
        let mut revision = 0u64;
        let mut repository_name = String::new();

        for line in text.lines() {
            if line == "--" {
                break;
            }
            let Some(tag) = line.chars().next() else {
                continue;
            };
            let value = &line[tag.len_utf8()..];
            match tag {
                'C' => {
                    root_catalog = Some(
                        ContentHash::from_hex(value)
                            .ok_or_else(|| Error::Manifest(format!("bad catalog hash: {value}")))?,
                    );
                }
                'R' => {
                    let raw = hex::decode(value)
                        .map_err(|_| Error::Manifest(format!("bad root path hash: {value}")))?;
                    let halves: [u8; 16] = raw
                        .try_into()
                        .map_err(|_| Error::Manifest("root path hash length".into()))?;
                    let hi = i64::from_le_bytes(halves[..8].try_into().unwrap());
                    let lo = i64::from_le_bytes(halves[8..].try_into().unwrap());
                    root_path_hash = Some(PathHash::from_halves(hi, lo));
                }
                'D' => {
                    ttl = value
                        .parse()
                        .map_err(|_| Error::Manifest(format!("bad TTL: {value}")))?;
                }
                'S' => {
                    revision = value
                        .parse()
                        .map_err(|_| Error::Manifest(format!("bad revision: {value}")))?;
                }
                'N' => repository_name = value.to_string(),
                _ => {} // unknown fields are forward compatibility
            }
        }

        Ok(Self {
            root_catalog: root_catalog
                .ok_or_else(|| Error::Manifest("missing root catalog record".into()))?,
            root_path_hash: root_path_hash.unwrap_or_else(|| PathHash::of_path("")),
            ttl,
            revision,
            repository_name,
        })
    }

    /// Serialize into the published line format (used by test fixtures and
    /// the `inspect` subcommand).
    pub fn to_text(&self) -> String {
        let (hi, lo) = self.root_path_hash.halves();
        let mut raw = Vec::with_capacity(16);
        raw.extend_from_slice(&hi.to_le_bytes());
        raw.extend_from_slice(&lo.to_le_bytes());
        format!(
            "C{}\nR{}\nD{}\nS{}\nN{}\n--\n",
            self.root_catalog,
            hex::encode(raw),
            self.ttl,
            self.revision,
            self.repository_name
        )
    }
}

/// Download the current manifest, check its signature and its repository name.
pub fn fetch_manifest(
    downloader: &dyn Downloader,
    verifier: &dyn SignatureVerifier,
    counters: &TransferCounters,
    fqrn: &str,
    scratch: &Path,
) -> Result<Manifest> {
    let destination = scratch.join(format!("manifest.{fqrn}"));
    let started = Instant::now();
    downloader.fetch(MANIFEST_URL_PATH, &destination)?;
    let text = std::fs::read_to_string(&destination)?;
    counters.account(text.len() as u64, started.elapsed().as_millis() as u64);
    let _ = std::fs::remove_file(&destination);

    if !verifier.verify(fqrn, &text) {
        return Err(Error::BadSignature(fqrn.to_string()).into());
    }
    let manifest = Manifest::parse(&text)?;
    if !manifest.repository_name.is_empty() && manifest.repository_name != fqrn {
        return Err(Error::Manifest(format!(
            "manifest is for {}, expected {fqrn}",
            manifest.repository_name
        ))
        .into());
    }
    Ok(manifest)
}
