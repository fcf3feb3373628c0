use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[must_use]
pub fn hash64<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[must_use]
pub fn hex64<T: Hash>(value: &T) -> String {
    format!("{:016x}", hash64(value))
}
