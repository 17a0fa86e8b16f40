pub mod tests {
    use rand::RngCore;

    use crate::{
        BlobId, BlobMetrics, DeletionIndexEntry, Headers, BLOB_NAME_HEADER, CREATED_BY_HEADER,
        DIRECT_PATH_BLOB_HEADER, TEMPORARY_BLOB_HEADER,
    };

    pub const TEST_STORE_NAME: &str = "test_store";
    pub const TEST_CREATED_BY: &str = "test";

    pub fn mock_headers(blob_name: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert(BLOB_NAME_HEADER.to_string(), blob_name.to_string());
        headers.insert(CREATED_BY_HEADER.to_string(), TEST_CREATED_BY.to_string());
        headers
    }

    pub fn mock_direct_path_headers(path: &str) -> Headers {
        let mut headers = mock_headers(path);
        headers.insert(DIRECT_PATH_BLOB_HEADER.to_string(), "true".to_string());
        headers
    }

    pub fn mock_temporary_headers(blob_name: &str) -> Headers {
        let mut headers = mock_headers(blob_name);
        headers.insert(TEMPORARY_BLOB_HEADER.to_string(), "true".to_string());
        headers
    }

    pub fn random_payload(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::rng().fill_bytes(&mut data);
        data
    }

    pub fn mock_blob_metrics(content_size: u64) -> BlobMetrics {
        BlobMetrics {
            creation_time_ms: 1_750_000_000_000,
            sha1: "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string(),
            sha256: None,
            content_size,
        }
    }

    pub fn mock_deletion_entry(blob_id: &str) -> DeletionIndexEntry {
        DeletionIndexEntry::new(TEST_STORE_NAME, BlobId::new(blob_id))
    }
}
