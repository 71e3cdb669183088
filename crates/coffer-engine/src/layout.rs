//! Remote object naming
//!
//! ```text
//! <encBackup>/@<encSnapshot>                     snapshot index
//! <encBackup>/<encSnapshot>/<encRelPath>         standalone entry object
//! <encBackup>/<encSnapshot>/<encRelPath>.NNN     window NNN of a large file
//! chunks/<id>                                    packed chunk
//! SALT-<hex>                                     repository salt marker
//! ```
//!
//! Encrypted tokens use the URL-safe base64 alphabet, which contains
//! neither `@` nor `.`, so both act as unambiguous markers.

pub const CHUNK_PREFIX: &str = "chunks/";
pub const SALT_PREFIX: &str = "SALT-";
pub const INDEX_MARKER: char = '@';

pub fn backup_prefix(enc_backup: &str) -> String {
    format!("{enc_backup}/")
}

pub fn index_prefix(enc_backup: &str) -> String {
    format!("{enc_backup}/{INDEX_MARKER}")
}

pub fn index_object(enc_backup: &str, enc_snapshot: &str) -> String {
    format!("{enc_backup}/{INDEX_MARKER}{enc_snapshot}")
}

/// Directory-like prefix owning every per-file object uploaded by one snapshot
pub fn snapshot_namespace(enc_backup: &str, enc_snapshot: &str) -> String {
    format!("{enc_backup}/{enc_snapshot}/")
}

pub fn entry_object(enc_backup: &str, enc_snapshot: &str, enc_rel_path: &str) -> String {
    format!("{enc_backup}/{enc_snapshot}/{enc_rel_path}")
}

pub fn window_object(entry_object: &str, index: u32) -> String {
    format!("{entry_object}.{index:03}")
}

pub fn new_chunk_name() -> String {
    format!("{CHUNK_PREFIX}{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    /// Slice of a packed chunk's plaintext
    Packed,
    /// One window of a large file
    Window(u32),
    /// A whole entry sealed on its own
    Standalone,
}

pub fn extent_kind(object: &str) -> ExtentKind {
    if object.starts_with(CHUNK_PREFIX) {
        return ExtentKind::Packed;
    }
    let last = object.rsplit('/').next().unwrap_or(object);
    match last.rsplit_once('.') {
        Some((_, idx)) => idx
            .parse::<u32>()
            .map(ExtentKind::Window)
            .unwrap_or(ExtentKind::Standalone),
        None => ExtentKind::Standalone,
    }
}

/// Move `object` from one namespace into another, if it lives in the first.
pub fn rehome(object: &str, from_ns: &str, to_ns: &str) -> Option<String> {
    object
        .strip_prefix(from_ns)
        .map(|rest| format!("{to_ns}{rest}"))
}

/// The top-level segment of an object name
pub fn top_level(object: &str) -> &str {
    object.split('/').next().unwrap_or(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_kinds() {
        assert_eq!(extent_kind("chunks/0af3"), ExtentKind::Packed);
        assert_eq!(extent_kind("Qk/Zm9v/YmFy.007"), ExtentKind::Window(7));
        assert_eq!(extent_kind("Qk/Zm9v/YmFy"), ExtentKind::Standalone);
    }

    #[test]
    fn test_window_suffix_is_zero_padded() {
        assert_eq!(window_object("b/s/f", 3), "b/s/f.003");
        assert_eq!(window_object("b/s/f", 1234), "b/s/f.1234");
    }

    #[test]
    fn test_rehome() {
        assert_eq!(
            rehome("b/s1/file.001", "b/s1/", "b/s2/").as_deref(),
            Some("b/s2/file.001")
        );
        assert_eq!(rehome("chunks/x", "b/s1/", "b/s2/"), None);
    }

    #[test]
    fn test_index_prefix_matches_only_indices() {
        let idx = index_object("bk", "snap");
        assert!(idx.starts_with(&index_prefix("bk")));
        assert!(!entry_object("bk", "snap", "f").starts_with(&index_prefix("bk")));
    }

    #[test]
    fn test_chunk_names_unique() {
        let a = new_chunk_name();
        assert!(a.starts_with(CHUNK_PREFIX));
        assert_ne!(a, new_chunk_name());
    }
}
