//! The `Ipfs` capability: read-only access to the IPFS directory attached to
//! the running script.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use vigil_error::IpfsError;

use crate::bridge::ScriptValue;
use crate::error::InvalidInputValue;
use crate::IpfsFetcher;

const GET_FILE_SITE: &str = "Ipfs.getFile()";
const MAX_FILE_NAME_LEN: usize = 255;

/// A text file fetched from an IPFS directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFile {
    /// File name inside the directory.
    pub name: String,
    /// File content.
    pub content: String,
}

/// Why `Ipfs.getFile()` failed. Not-found is not a failure.
#[derive(Debug, thiserror::Error)]
pub enum IpfsCallError {
    /// The file name broke the call contract.
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputValue),

    /// The fetch failed for a reason other than absence.
    #[error("Ipfs.getFile() failed: {0}")]
    Fetch(#[from] IpfsError),
}

/// Reads files from the directory associated with a script.
#[derive(Clone)]
pub struct DirectoryBasedIpfs {
    fetcher: Arc<dyn IpfsFetcher>,
    directory: String,
}

impl DirectoryBasedIpfs {
    /// Bind `fetcher` to `directory`.
    pub fn new(fetcher: Arc<dyn IpfsFetcher>, directory: impl Into<String>) -> Self {
        Self {
            fetcher,
            directory: directory.into(),
        }
    }

    /// The bound directory hash.
    pub fn directory(&self) -> &str {
        &self.directory
    }

    fn get_file(&self, name: &str) -> Result<Option<String>, IpfsError> {
        match self
            .fetcher
            .fetch_text_file_from_directory(&self.directory, name)
        {
            Ok(file) => Ok(Some(file.content)),
            Err(e) if e.is_not_found() => {
                tracing::debug!(directory = %self.directory, file = %name, "ipfs file not found");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// The `Ipfs` variant bound to one evaluation.
#[derive(Clone, Default)]
pub enum Ipfs {
    /// Every file is absent.
    #[default]
    Noop,
    /// Files come from the script's directory.
    DirectoryBased(DirectoryBasedIpfs),
}

impl Ipfs {
    /// Directory-based when both a fetcher and a directory exist, no-op otherwise.
    pub fn select(fetcher: Option<Arc<dyn IpfsFetcher>>, directory: Option<&str>) -> Self {
        match (fetcher, directory) {
            (Some(fetcher), Some(dir)) if !dir.is_empty() => {
                Self::DirectoryBased(DirectoryBasedIpfs::new(fetcher, dir))
            }
            _ => Self::Noop,
        }
    }

    /// Whether this is the directory-based variant.
    pub fn is_directory_based(&self) -> bool {
        matches!(self, Self::DirectoryBased(_))
    }

    /// `Ipfs.getFile(name)`: the content, or `None` when there is no such file.
    pub fn get_file(&self, name: &ScriptValue) -> Result<Option<String>, IpfsCallError> {
        let name = validate_file_name(name)?;
        match self {
            Self::Noop => Ok(None),
            Self::DirectoryBased(ipfs) => Ok(ipfs.get_file(name)?),
        }
    }
}

fn validate_file_name(value: &ScriptValue) -> Result<&str, InvalidInputValue> {
    let invalid = |reason: String| InvalidInputValue::new(GET_FILE_SITE, 0, reason);
    let name = value
        .as_str()
        .ok_or_else(|| invalid(format!("file name must be a string, got {}", value.type_name())))?;
    if name.is_empty() {
        return Err(invalid("file name must not be empty".into()));
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(invalid(format!(
            "file name too long ({} bytes, max {MAX_FILE_NAME_LEN} bytes)",
            name.len()
        )));
    }
    if name.contains("..") {
        return Err(invalid("file name must not contain '..'".into()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("file name must not contain path separators".into()));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(invalid("file name must not contain control characters".into()));
    }
    Ok(name)
}

/// [`IpfsFetcher`] that reads through an HTTP gateway
/// (`GET {gateway}/ipfs/{directory}/{file}`).
pub struct GatewayIpfsFetcher {
    gateway_url: String,
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl GatewayIpfsFetcher {
    /// A fetcher for `gateway_url` (trailing slashes are ignored).
    pub fn new(gateway_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            gateway_url: gateway_url.into().trim_end_matches('/').to_string(),
            timeout,
            client: OnceLock::new(),
        }
    }

    /// URL of `file_name` inside `directory`.
    pub fn file_url(&self, directory: &str, file_name: &str) -> String {
        format!("{}/ipfs/{directory}/{file_name}", self.gateway_url)
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, IpfsError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let built = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| IpfsError::Transport(e.to_string()))?;
        Ok(self.client.get_or_init(|| built))
    }
}

impl IpfsFetcher for GatewayIpfsFetcher {
    fn fetch_text_file_from_directory(
        &self,
        directory: &str,
        file_name: &str,
    ) -> Result<TextFile, IpfsError> {
        let response = self
            .client()?
            .get(self.file_url(directory, file_name))
            .send()
            .map_err(|e| IpfsError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IpfsError::Http {
                status: status.as_u16(),
            });
        }
        let content = response
            .text()
            .map_err(|e| IpfsError::Transport(e.to_string()))?;
        if content.is_empty() {
            return Err(IpfsError::EmptyResponse);
        }
        Ok(TextFile {
            name: file_name.to_string(),
            content,
        })
    }
}
