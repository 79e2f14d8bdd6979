//! Content-addressed identifiers for provenance entries.
//!
//! Ids depend only on content: identical inputs reproduce the identical id at
//! any time, and context files are hashed in sorted path order.

use sha2::{Digest, Sha256};

/// Hex characters kept from each sha256 digest.
pub const HASH_LEN: usize = 16;

fn truncated_hex(hasher: Sha256) -> String {
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(HASH_LEN);
    digest
}

pub fn hash_prompt(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    truncated_hex(hasher)
}

/// Hash `(path, content)` pairs. Callers may pass them in any order; a NUL
/// separates each path from its content so boundaries cannot be forged.
pub fn hash_context<'a, I>(files: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut files: Vec<(&str, &[u8])> = files.into_iter().collect();
    files.sort_by(|a, b| a.0.cmp(b.0));
    let mut hasher = Sha256::new();
    for (path, content) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(content);
    }
    truncated_hex(hasher)
}

pub fn derive_id(
    task_id: &str,
    prompt_hash: &str,
    context_hash: &str,
    parent_id: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    for part in [task_id, prompt_hash, context_hash, parent_id.unwrap_or("")] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    truncated_hex(hasher)
}
