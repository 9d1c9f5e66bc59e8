use anyhow::{Result, bail};
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info};

use crate::core::entry::hash_file;
use crate::db::records::CatalogRecord;

/// Result of a successful verification
#[derive(Debug)]
pub struct VerifyResult {
    pub files_verified: u64,
    pub bytes_verified: u64,
}

/// Details of a file that failed verification
#[derive(Debug)]
pub struct FileMismatch {
    pub relative_path: String,
    pub reason: MismatchReason,
}

/// Reason a file failed verification
#[derive(Debug)]
pub enum MismatchReason {
    /// BLAKE3 hash of the mirrored copy differs from the catalog
    HashMismatch,
    /// Cataloged file is absent from the mirror
    MissingInDestination,
    /// Mirrored copy exists but could not be read
    Unreadable(String),
}

/// Re-hash every cataloged file on a mirror destination.
///
/// Returns Ok if all files match, Err listing the mismatches otherwise.
pub fn verify_mirror(mirror_root: &Path, records: &[CatalogRecord]) -> Result<VerifyResult> {
    let total = records.len() as u64;
    info!(destination = %mirror_root.display(), total_files = total, "Starting mirror verification");

    let mut mismatches: Vec<FileMismatch> = Vec::new();
    let mut bytes_verified: u64 = 0;

    for record in records {
        let path = mirror_root.join(&record.path);
        debug!(file = %record.path, "Verifying file");

        let reason = match hash_file(&path) {
            Ok(hash) if hash == record.hash => {
                bytes_verified += record.size;
                continue;
            }
            Ok(_) => MismatchReason::HashMismatch,
            Err(e) if e.kind() == ErrorKind::NotFound => MismatchReason::MissingInDestination,
            Err(e) => {
                debug!(file = %record.path, error = %e, "Failed to hash mirrored file");
                MismatchReason::Unreadable(e.to_string())
            }
        };
        mismatches.push(FileMismatch {
            relative_path: record.path.clone(),
            reason,
        });
    }

    if !mismatches.is_empty() {
        info!(mismatches = mismatches.len(), "Verification failed");
        bail!(format_mismatch_error(&mismatches));
    }

    info!(
        files_verified = total,
        bytes_verified = bytes_verified,
        "Verification complete"
    );

    Ok(VerifyResult {
        files_verified: total,
        bytes_verified,
    })
}

/// Format mismatch errors into a human-readable message
fn format_mismatch_error(mismatches: &[FileMismatch]) -> String {
    let mut msg = format!(
        "Verification failed: {} file(s) did not match",
        mismatches.len()
    );

    // Show details for first 10 mismatches
    for m in mismatches.iter().take(10) {
        let reason = match &m.reason {
            MismatchReason::HashMismatch => "hash mismatch".to_string(),
            MismatchReason::MissingInDestination => "missing in destination".to_string(),
            MismatchReason::Unreadable(e) => format!("unreadable ({})", e),
        };
        msg.push_str(&format!("\n  - {}: {}", m.relative_path, reason));
    }

    if mismatches.len() > 10 {
        msg.push_str(&format!("\n  ... and {} more", mismatches.len() - 10));
    }

    msg
}
