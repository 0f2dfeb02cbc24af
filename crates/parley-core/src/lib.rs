//! Low-level helpers shared across Parley crates.
//!
//! Provides the atomic state-file writer used by conversation and model
//! persistence.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use time_utils::current_unix_timestamp_ms;

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;

    #[test]
    fn unit_unix_timestamp_ms_is_monotonic_enough_for_temp_names() {
        let first = current_unix_timestamp_ms();
        let second = current_unix_timestamp_ms();
        assert!(first > 1_600_000_000_000);
        assert!(second >= first);
    }

    #[test]
    fn functional_write_text_atomic_replaces_existing_state_file() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("memory.json");
        write_text_atomic(&path, "{\"1\": []}").expect("first write");
        write_text_atomic(&path, "{}").expect("second write");
        let contents = read_to_string(&path).expect("read");
        assert_eq!(contents, "{}");
    }

    #[test]
    fn functional_write_text_atomic_creates_missing_parent_dirs() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("state").join("nested").join("model.json");
        write_text_atomic(&path, "{\"model\":\"gpt-5.1\"}").expect("write");
        assert!(path.exists());
    }

    #[test]
    fn regression_write_text_atomic_rejects_directory_targets() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let error = write_text_atomic(tempdir.path(), "x").expect_err("directory target");
        assert!(error.to_string().contains("is a directory"));
    }
}
