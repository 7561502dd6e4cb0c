use core::time::Duration;

use thiserror::Error;

use crate::{config::DatabaseConfig, reading::Reading, DEVICE_TAG};

pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(3);
pub const CONTENT_TYPE: &str = "text/plain";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

/// A fully addressed InfluxDB v2 write, ready to hand to an HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub url: String,
    pub authorization: String,
    pub body: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    Accepted(u16),
    Rejected(u16),
    Failed(UploadError),
}

impl WriteRequest {
    pub fn new(database: &DatabaseConfig, reading: &Reading) -> Self {
        Self {
            url: write_url(database),
            authorization: format!("Token {}", database.token),
            body: encode_reading(reading),
            timeout: UPLOAD_TIMEOUT,
        }
    }

    pub fn headers(&self) -> [(&'static str, &str); 2] {
        [
            ("Authorization", self.authorization.as_str()),
            ("Content-Type", CONTENT_TYPE),
        ]
    }
}

impl UploadStatus {
    pub fn classify(result: Result<u16, UploadError>) -> Self {
        match result {
            Ok(code) if (200..300).contains(&code) => Self::Accepted(code),
            Ok(code) => Self::Rejected(code),
            Err(err) => Self::Failed(err),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

pub fn write_url(database: &DatabaseConfig) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("bucket", &database.bucket)
        .append_pair("org", &database.org)
        .append_pair("precision", "s")
        .finish();

    format!(
        "{}/api/v2/write?{query}",
        database.url.trim_end_matches('/')
    )
}

/// Two line-protocol records, temperature first, joined by a single newline.
pub fn encode_reading(reading: &Reading) -> String {
    format!(
        "temperature,device={DEVICE_TAG} value={:.2}\nhumidity,device={DEVICE_TAG} value={:.2}",
        reading.temperature_c, reading.humidity
    )
}
