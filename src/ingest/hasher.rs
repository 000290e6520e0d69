use sha2::{Sha256, Digest};

const DIGEST_PREFIX_LEN: usize = 12;

pub fn calculate_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `<millis>-<12 hex of sha256>.<ext>` for a freshly uploaded original.
pub fn stored_filename(bytes: &[u8], extension: &str, unix_millis: i64) -> String {
    let hash = calculate_hash(bytes);
    format!("{}-{}.{}", unix_millis, &hash[..DIGEST_PREFIX_LEN], extension)
}
