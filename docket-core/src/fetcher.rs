use std::time::Duration;

use async_trait::async_trait;

use crate::error::FetchError;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("docket/", env!("CARGO_PKG_VERSION"));
const DEFAULT_MIME_TYPE: &str = "text/html";

/// A fetched document before any filtering.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub mime_type: String,
    pub content: Vec<u8>,
}

/// Retrieval of a remote document. The engine only distinguishes
/// `InaccessibleContent` (reported, batch continues) from everything else
/// (aborts the batch), so implementations decide which failures are which.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<FetchedDocument, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| FetchError::Invalid {
                location: "-".to_string(),
                detail: format!("failed to build http client: {err}"),
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, location: &str) -> Result<FetchedDocument, FetchError> {
        let response = self
            .client
            .get(location)
            .send()
            .await
            .map_err(|err| classify(location, err))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(FetchError::inaccessible(
                location,
                format!("http {}", status.as_u16()),
            ));
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());

        let content = response
            .bytes()
            .await
            .map_err(|err| classify(location, err))?
            .to_vec();

        Ok(FetchedDocument { mime_type, content })
    }
}

/// Builder failures are our bug; anything that happened on the wire is the
/// upstream's problem and stays recoverable.
fn classify(location: &str, err: reqwest::Error) -> FetchError {
    if err.is_builder() {
        FetchError::Invalid {
            location: location.to_string(),
            detail: err.to_string(),
        }
    } else {
        FetchError::inaccessible(location, err.to_string())
    }
}
