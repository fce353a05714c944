//! Deterministic session identity.
//!
//! A session id is `session_` followed by the first 64 bits of the
//! SHA-256 of the absolute binary path, hex-encoded. The same binary
//! always maps to the same id; a hash collision with a *different* path
//! (detected through the stored `state.json`) appends `_2`, `_3`, ….

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::state::SessionState;

/// First 64 bits of SHA-256 over the path, as 16 hex chars.
pub fn hash_binary_path(binary_path: &str) -> String {
    let digest = Sha256::digest(binary_path.as_bytes());
    hex::encode(&digest[..8])
}

/// Derive the session id for a binary, resolving hash collisions against
/// existing session directories under `sessions_root`.
pub fn generate_session_id(sessions_root: &Path, binary_path: &str) -> String {
    let session_id = format!("session_{}", hash_binary_path(binary_path));

    let session_dir = sessions_root.join(&session_id);
    if let Ok(state) = SessionState::load_dir(&session_dir) {
        if state.binary_path != binary_path {
            tracing::warn!(
                session_id,
                ours = binary_path,
                theirs = %state.binary_path,
                "session id hash collision, appending suffix"
            );
            let mut suffix = 2;
            while sessions_root
                .join(format!("{session_id}_{suffix}"))
                .exists()
            {
                suffix += 1;
            }
            return format!("{session_id}_{suffix}");
        }
    }

    session_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_16_hex_chars() {
        let a = hash_binary_path("/bin/ls");
        let b = hash_binary_path("/bin/ls");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash_binary_path("/bin/ls"), hash_binary_path("/bin/cat"));
    }

    #[test]
    fn session_id_is_prefixed_and_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let id1 = generate_session_id(tmp.path(), "/b/a.out");
        let id2 = generate_session_id(tmp.path(), "/b/a.out");
        assert_eq!(id1, id2);
        assert!(id1.starts_with("session_"));
        assert_eq!(id1.len(), "session_".len() + 16);
    }

    #[test]
    fn same_path_with_existing_dir_keeps_id() {
        let tmp = tempfile::tempdir().unwrap();
        let id = generate_session_id(tmp.path(), "/b/a.out");
        let dir = tmp.path().join(&id);
        std::fs::create_dir_all(&dir).unwrap();
        SessionState {
            session_id: id.clone(),
            binary_path: "/b/a.out".into(),
            orchestrator_pid: 1234,
            created_at: 0,
        }
        .store_dir(&dir)
        .unwrap();

        assert_eq!(generate_session_id(tmp.path(), "/b/a.out"), id);
    }

    #[test]
    fn collision_with_different_path_appends_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let id = generate_session_id(tmp.path(), "/b/a.out");
        let dir = tmp.path().join(&id);
        std::fs::create_dir_all(&dir).unwrap();
        // Same directory claims a *different* binary: forced collision.
        SessionState {
            session_id: id.clone(),
            binary_path: "/somewhere/else".into(),
            orchestrator_pid: 1234,
            created_at: 0,
        }
        .store_dir(&dir)
        .unwrap();

        let suffixed = generate_session_id(tmp.path(), "/b/a.out");
        assert_eq!(suffixed, format!("{id}_2"));

        // A second collision takes the next suffix.
        std::fs::create_dir_all(tmp.path().join(&suffixed)).unwrap();
        assert_eq!(generate_session_id(tmp.path(), "/b/a.out"), format!("{id}_3"));
    }
}
