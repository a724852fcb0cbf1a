fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use chunkflow_protocol::{
        ErrorKind, MergeRequest, SessionSnapshot, UploadChunkRequest, UploadState,
    };
    use chunkflow_uploader::UploadConfig;

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON numbers so that `60` and `60.0` compare equal.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture, re-serializes it, and compares the JSON values.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  encoded: {reserialized}"
        );
        parsed
    }

    // --- Submission payloads ---

    #[test]
    fn fixture_upload_chunk_request() {
        let req = roundtrip_test::<UploadChunkRequest>("upload_chunk_request.json");
        assert_eq!(req.chunk_index, 3);
        assert_eq!(req.data, b"hello");
    }

    #[test]
    fn fixture_merge_request() {
        let req = roundtrip_test::<MergeRequest>("merge_request.json");
        assert_eq!(req.chunk_count, 5);
    }

    #[test]
    fn upload_chunk_without_checksum() {
        let mut fixture = load_fixture("upload_chunk_request.json");
        fixture.as_object_mut().unwrap().remove("checksum");
        let req: UploadChunkRequest = serde_json::from_value(fixture).unwrap();
        assert!(req.checksum.is_empty());
        let encoded = serde_json::to_value(&req).unwrap();
        assert!(encoded.get("checksum").is_none());
    }

    #[test]
    fn traversal_hash_rejected() {
        let mut fixture = load_fixture("merge_request.json");
        fixture["fileHash"] = serde_json::json!("../../etc/passwd");
        assert!(serde_json::from_value::<MergeRequest>(fixture).is_err());
    }

    #[test]
    fn uppercase_hash_normalized() {
        let mut fixture = load_fixture("merge_request.json");
        let upper = fixture["fileHash"].as_str().unwrap().to_uppercase();
        fixture["fileHash"] = serde_json::json!(upper);
        let req: MergeRequest = serde_json::from_value(fixture).unwrap();
        assert_eq!(req.file_hash.as_str(), upper.to_lowercase());
    }

    // --- Observable session state ---

    #[test]
    fn fixture_session_snapshot() {
        let snapshot = roundtrip_test::<SessionSnapshot>("session_snapshot.json");
        assert_eq!(snapshot.state, UploadState::Uploading);
        assert!(snapshot.error.is_none());
        assert_eq!(snapshot.pending_chunks, vec![3, 4]);
    }

    #[test]
    fn fixture_session_snapshot_error() {
        let snapshot = roundtrip_test::<SessionSnapshot>("session_snapshot_error.json");
        assert_eq!(snapshot.state, UploadState::Error);
        assert_eq!(snapshot.error.unwrap().kind, ErrorKind::Transfer);
    }

    #[test]
    fn default_snapshot_omits_optional_fields() {
        let encoded = serde_json::to_value(SessionSnapshot::default()).unwrap();
        assert_eq!(encoded["state"], "default");
        assert!(encoded.get("error").is_none());
        assert!(encoded.get("fileHash").is_none());
        assert!(encoded.get("pendingChunks").is_none());
    }

    // --- Client configuration ---

    #[test]
    fn fixture_upload_config_matches_defaults() {
        let config = roundtrip_test::<UploadConfig>("upload_config.json");
        assert_eq!(config, UploadConfig::default());
    }

    #[test]
    fn empty_config_object_is_default() {
        let config: UploadConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, UploadConfig::default());
    }
}
