//! HTTPS transport for raw repository metadata.
//!
//! Role documents (`root.json`, `timestamp.json`, ...) live under
//! `metadata/<name>` below the server URL.

use std::io::Read;
use std::time::Duration;

use thiserror::Error;
use url::Url;

const METADATA_PREFIX: &str = "metadata/";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid server URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("request {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// A remote file being streamed.
pub struct RemoteFile {
    pub reader: Box<dyn Read + Send>,
    /// Size announced by the server, if any.
    pub size: Option<u64>,
}

impl std::fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFile")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Raw access to repository files, before any verification.
pub trait RemoteStore: Send {
    fn get_meta(&self, name: &str) -> Result<RemoteFile, RemoteError>;
}

/// [`RemoteStore`] over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    base: Url,
    client: reqwest::blocking::Client,
}

impl HttpRemoteStore {
    /// Create a store rooted at `server_url`.
    ///
    /// With `insecure_transport` set, TLS certificates are not verified.
    /// Tampering is still caught by the signed metadata checks.
    pub fn new(server_url: &str, insecure_transport: bool) -> Result<Self, RemoteError> {
        let base = Self::base_url(server_url)?;
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("stagehand/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(insecure_transport)
            .build()
            .map_err(RemoteError::Client)?;
        Ok(Self { base, client })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn meta_url(&self, name: &str) -> Result<Url, RemoteError> {
        self.join(METADATA_PREFIX, name)
    }

    fn base_url(server_url: &str) -> Result<Url, RemoteError> {
        let invalid = |source| RemoteError::InvalidUrl {
            url: server_url.to_string(),
            source,
        };
        let mut base = Url::parse(server_url).map_err(invalid)?;
        if base.cannot_be_a_base() {
            return Err(invalid(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }
        // Without a trailing slash, joins would replace the last segment.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base)
    }

    fn join(&self, prefix: &str, path: &str) -> Result<Url, RemoteError> {
        let relative = format!("{}{}", prefix, path.trim_start_matches('/'));
        self.base
            .join(&relative)
            .map_err(|source| RemoteError::InvalidUrl {
                url: relative,
                source,
            })
    }

    fn get(&self, url: Url) -> Result<RemoteFile, RemoteError> {
        tracing::debug!(%url, "fetching remote file");
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|source| RemoteError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(RemoteError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(RemoteFile {
            size: response.content_length(),
            reader: Box::new(response),
        })
    }
}

impl RemoteStore for HttpRemoteStore {
    fn get_meta(&self, name: &str) -> Result<RemoteFile, RemoteError> {
        self.get(self.meta_url(name)?)
    }
}
