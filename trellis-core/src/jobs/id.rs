use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// SHA-256 over the canonical JSON array of the sorted, de-duplicated input
/// ids, as lowercase hex. Independent of input order.
pub fn input_hash(ids: &[String]) -> Result<String> {
    let mut sorted: Vec<&str> = ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let canonical = serde_json::to_vec(&sorted)?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

/// `yymmdd-HHMMSSmmm-<first 8 hex of the input hash>`.
pub fn job_id(now: DateTime<Utc>, input_hash: &str) -> String {
    let prefix: String = input_hash.chars().take(8).collect();
    format!("{}-{prefix}", now.format("%y%m%d-%H%M%S%3f"))
}
