mod digest;
mod fs;

pub use digest::{canonical_json_digest, sha256_bytes};
pub use fs::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, scratch_suffix};
