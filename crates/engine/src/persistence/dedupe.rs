// Consecutive-duplicate detection for persisted updates.
//
// The coordinator keeps the fingerprint of the last record it wrote per
// document and skips a new update whose fingerprint matches.

use sha2::{Digest, Sha256};

use crate::config::DuplicateCheck;

/// Reduces a payload to something cheap to keep and compare.
pub trait DuplicateComparator: Send + Sync {
    fn fingerprint(&self, payload: &[u8]) -> Vec<u8>;

    fn is_duplicate(&self, previous: &[u8], payload: &[u8]) -> bool {
        previous == self.fingerprint(payload).as_slice()
    }
}

/// Keeps the whole payload; no false positives at the cost of memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralComparator;

impl DuplicateComparator for StructuralComparator {
    fn fingerprint(&self, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }

    fn is_duplicate(&self, previous: &[u8], payload: &[u8]) -> bool {
        previous == payload
    }
}

/// SHA-256 of the payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Comparator;

impl DuplicateComparator for Sha256Comparator {
    fn fingerprint(&self, payload: &[u8]) -> Vec<u8> {
        Sha256::digest(payload).to_vec()
    }
}

/// Comparator for the configured check, `None` when suppression is off.
pub fn comparator_for(check: DuplicateCheck) -> Option<Box<dyn DuplicateComparator>> {
    match check {
        DuplicateCheck::Structural => Some(Box::new(StructuralComparator)),
        DuplicateCheck::Sha256 => Some(Box::new(Sha256Comparator)),
        DuplicateCheck::Disabled => None,
    }
}

/// Lowercase hex, for logs.
pub fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
