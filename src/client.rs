use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Http client for a single camera.
///
/// All api commands go through one POST endpoint carrying
/// `{"Request": {"Command": ..., "Params": ...}}`; the camera answers with
/// `{"Response": {"Requested": ..., "Result": "Success", "Data": ...}}`.
#[derive(Debug, Clone)]
pub struct CameraClient {
    http: Client,
    base: String,
    auth_user: String,
    auth_pass: String,
}

const AUTH_URI: &str = "/api.php";
const CMD_URI: &str = "/cgi-bin/api.cgi";
const IMAGE_URI: &str = "/cgi-bin/get_jpg.cgi";

impl CameraClient {
    pub fn new(
        hostaddr: &str,
        hostport: u16,
        auth_user: &str,
        auth_pass: &str,
        timeout: Duration,
    ) -> Result<Self, CameraClientError> {
        let base = if hostaddr.starts_with("http") {
            hostaddr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}:{}", hostaddr, hostport)
        };
        let http = Client::builder().timeout(timeout).build().map_err(CameraClientError::from)?;
        Ok(CameraClient {
            http,
            base,
            auth_user: auth_user.to_string(),
            auth_pass: auth_pass.to_string(),
        })
    }

    /// Authenticate against the camera. Must succeed before the first poll.
    pub async fn open(&self) -> Result<(), CameraClientError> {
        let uri = format!("{}{}", self.base, AUTH_URI);
        let response = self
            .http
            .get(&uri)
            .basic_auth(&self.auth_user, Some(&self.auth_pass))
            .send()
            .await
            .map_err(CameraClientError::from)?;
        Self::check_status(response.status())?;
        Ok(())
    }

    /// Issue an api command and return the response `Data` object.
    pub async fn request(&self, command: &str, params: Option<Value>) -> Result<Value, CameraClientError> {
        let mut payload = json!({ "Request": { "Command": command } });
        if let Some(params) = params {
            payload["Request"]["Params"] = params;
        }

        let uri = format!("{}{}", self.base, CMD_URI);
        debug!(command, "🔸 tx: {}", payload);
        let response = self
            .http
            .post(&uri)
            .basic_auth(&self.auth_user, Some(&self.auth_pass))
            .json(&payload)
            .send()
            .await
            .map_err(CameraClientError::from)?;

        Self::check_status(response.status())?;

        let body: Value = response.json().await.map_err(|e| CameraClientError::Protocol {
            reason: format!("response body is not JSON: {}", e),
        })?;
        Self::check_response_data(command, body)
    }

    /// Opaque URL for the camera's still-image endpoint. The engine passes
    /// this through to collaborators; fetch pacing lives in the preview module.
    pub fn still_image_url(&self) -> String {
        format!("{}{}", self.base, IMAGE_URI)
    }

    /// Fetch one Jpeg frame. The encoder must have been started through
    /// the `JpegEncode` command first.
    pub async fn fetch_still_image(&self) -> Result<Vec<u8>, CameraClientError> {
        let response = self
            .http
            .get(self.still_image_url())
            .basic_auth(&self.auth_user, Some(&self.auth_pass))
            .send()
            .await
            .map_err(CameraClientError::from)?;
        Self::check_status(response.status())?;
        let bytes = response.bytes().await.map_err(CameraClientError::from)?;
        Ok(bytes.to_vec())
    }

    fn check_status(status: StatusCode) -> Result<(), CameraClientError> {
        if status.is_success() {
            return Ok(());
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CameraClientError::Auth),
            StatusCode::NOT_FOUND => Err(CameraClientError::NotFound),
            s if s.is_server_error() => Err(CameraClientError::Transient { reason: format!("http {}", s) }),
            s => Err(CameraClientError::Protocol { reason: format!("unexpected http {}", s) }),
        }
    }

    fn check_response_data(command: &str, body: Value) -> Result<Value, CameraClientError> {
        let response = &body["Response"];
        if response["Requested"].as_str() != Some(command) {
            return Err(CameraClientError::Protocol {
                reason: format!("response does not match request '{}'", command),
            });
        }
        if response["Result"].as_str() != Some("Success") {
            return Err(CameraClientError::Protocol {
                reason: format!("'{}' reported {}", command, response["Result"]),
            });
        }
        Ok(response.get("Data").cloned().unwrap_or(Value::Null))
    }
}

#[derive(Error, Debug)]
pub enum CameraClientError {
    /// Credentials rejected. Fatal at the session level; never retried.
    #[error("authentication rejected by the camera")]
    Auth,
    /// The camera does not implement the requested command. Cached as a
    /// capability absence for the session lifetime.
    #[error("command not supported by this camera")]
    NotFound,
    /// Connect/timeout/5xx. The session backs off and retries.
    #[error("transient transport error: {reason}")]
    Transient { reason: String },
    /// The camera answered, but not with what the protocol promises.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },
}

impl From<reqwest::Error> for CameraClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            CameraClientError::Transient { reason: e.to_string() }
        } else if let Some(status) = e.status() {
            match Self::classify_status(status) {
                Some(err) => err,
                None => CameraClientError::Protocol { reason: e.to_string() },
            }
        } else {
            CameraClientError::Transient { reason: e.to_string() }
        }
    }
}

impl CameraClientError {
    fn classify_status(status: StatusCode) -> Option<CameraClientError> {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Some(CameraClientError::Auth),
            StatusCode::NOT_FOUND => Some(CameraClientError::NotFound),
            s if s.is_server_error() => Some(CameraClientError::Transient { reason: format!("http {}", s) }),
            _ => None,
        }
    }

    /// True when the session should go to `sleeping` and retry rather than
    /// fail permanently.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraClientError::Transient { .. } | CameraClientError::Protocol { .. })
    }
}
