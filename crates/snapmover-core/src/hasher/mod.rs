mod xxhash;

pub use xxhash::{hash_data, hash_file};
