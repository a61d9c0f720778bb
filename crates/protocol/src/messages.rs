use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Opens an upload session for a fingerprinted file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub original_name: String,
    #[serde(rename = "md5")]
    pub fingerprint: String,
    pub chunk_size: u64,
    #[serde(rename = "chunkNum")]
    pub chunk_count: u32,
    pub content_type: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Payload of `/check/{fingerprint}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckData {
    #[serde(default)]
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Payload of `/init`.
///
/// `destinations` holds one pre-authorized URL per chunk that still has to
/// be sent. When it is shorter than the requested chunk count, the missing
/// leading chunks are already stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadData {
    #[serde(rename = "uploadId")]
    pub session_id: String,
    #[serde(rename = "urlList", default)]
    pub destinations: Vec<String>,
}

/// Payload of `/merge/{fingerprint}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeData {
    #[serde(default)]
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ApiResponse;

    #[test]
    fn init_request_field_names() {
        let req = InitUploadRequest {
            original_name: "movie.mkv".into(),
            fingerprint: "d41d8cd98f00b204e9800998ecf8427e".into(),
            chunk_size: 5 * 1024 * 1024,
            chunk_count: 3,
            content_type: "video/x-matroska".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["originalName"], "movie.mkv");
        assert_eq!(json["md5"], "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(json["chunkSize"], 5 * 1024 * 1024);
        assert_eq!(json["chunkNum"], 3);
        assert_eq!(json["contentType"], "video/x-matroska");
    }

    #[test]
    fn init_response_parses_url_list() {
        let body = br#"{"code":200,"data":{"uploadId":"s-1","urlList":["http://a/0","http://a/1"]}}"#;
        let resp: ApiResponse<InitUploadData> = ApiResponse::from_slice(body).unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data.session_id, "s-1");
        assert_eq!(data.destinations, vec!["http://a/0", "http://a/1"]);
    }

    #[test]
    fn init_response_missing_url_list_is_empty() {
        let body = br#"{"code":200,"data":{"uploadId":"s-1"}}"#;
        let resp: ApiResponse<InitUploadData> = ApiResponse::from_slice(body).unwrap();
        assert!(resp.data.unwrap().destinations.is_empty());
    }

    #[test]
    fn check_hit_carries_url() {
        let body = br#"{"code":700,"data":{"exists":true,"url":"http://files/abc"}}"#;
        let resp: ApiResponse<CheckData> = ApiResponse::from_slice(body).unwrap();
        assert!(resp.is_hit());
        assert_eq!(resp.data.unwrap().url.as_deref(), Some("http://files/abc"));
    }
}
