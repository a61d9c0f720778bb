use serde::{Deserialize, Serialize};

use crate::constants::CODE_HIT;

/// Envelope wrapping every response from the remote service.
///
/// `data` is optional: error responses routinely omit it, and the check
/// endpoint leaves it out on a miss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Builds a response with the given code and payload.
    pub fn new(code: i32, data: Option<T>) -> Self {
        Self {
            code,
            message: String::new(),
            data,
        }
    }

    /// Attaches a message to the response.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Returns `true` when the code is the distinguished hit/success value.
    pub fn is_hit(&self) -> bool {
        self.code == CODE_HIT
    }
}

impl<T: for<'de> Deserialize<'de>> ApiResponse<T> {
    /// Decodes a response body.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MergeData;

    #[test]
    fn missing_data_is_none() {
        let resp: ApiResponse<MergeData> =
            ApiResponse::from_slice(br#"{"code":500,"message":"boom"}"#).unwrap();
        assert_eq!(resp.code, 500);
        assert_eq!(resp.message, "boom");
        assert!(resp.data.is_none());
        assert!(!resp.is_hit());
    }

    #[test]
    fn null_data_is_none() {
        let resp: ApiResponse<MergeData> =
            ApiResponse::from_slice(br#"{"code":700,"data":null}"#).unwrap();
        assert!(resp.is_hit());
        assert!(resp.data.is_none());
    }

    #[test]
    fn empty_message_omitted() {
        let resp = ApiResponse::new(
            CODE_HIT,
            Some(MergeData {
                url: "http://x/y".into(),
            }),
        );
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("message"));
        assert!(json.contains(r#""url":"http://x/y""#));
    }
}
