//! Wire conventions shared by the gateway and Record Store clients.

use serde::Deserialize;

/// Response envelope used by every backend endpoint:
/// `{ "success": bool, "data": T, "message": "..." }`.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default = "default_success")]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_success() -> bool {
    true
}

impl<T> ApiEnvelope<T> {
    /// Unwrap `data` on success, or return the server's message.
    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(self
                .message
                .unwrap_or_else(|| "response carried no data".to_string())),
            (false, _) => Err(self
                .message
                .unwrap_or_else(|| "request was not successful".to_string())),
        }
    }
}

/// Supplies the opaque bearer credential attached to outbound requests.
///
/// Token issuance and refresh belong to the auth layer; this seam only reads
/// whatever is current.
pub trait BearerSource: Send + Sync {
    fn bearer(&self) -> Option<String>;
}

/// A fixed token, or none at all.
#[derive(Debug, Clone, Default)]
pub struct StaticBearer(pub Option<String>);

impl StaticBearer {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }
}

impl BearerSource for StaticBearer {
    fn bearer(&self) -> Option<String> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_yields_data() {
        let env: ApiEnvelope<Vec<u32>> =
            serde_json::from_str(r#"{"success":true,"data":[1,2]}"#).unwrap();
        assert_eq!(env.into_result(), Ok(vec![1, 2]));
    }

    #[test]
    fn failed_envelope_yields_message() {
        let env: ApiEnvelope<u32> =
            serde_json::from_str(r#"{"success":false,"message":"Invalid phone"}"#).unwrap();
        assert_eq!(env.into_result(), Err("Invalid phone".to_string()));
    }

    #[test]
    fn missing_data_is_an_error() {
        let env: ApiEnvelope<u32> = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(env.into_result().is_err());
    }

    #[test]
    fn static_bearer() {
        assert_eq!(StaticBearer::new("t").bearer().as_deref(), Some("t"));
        assert_eq!(StaticBearer::default().bearer(), None);
    }
}
