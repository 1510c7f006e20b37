use crate::core::{Result, StoreError};
use percent_encoding::percent_decode_str;
use std::fmt;
use std::path::PathBuf;
use url::Url;

/// Parsed connection descriptor
///
/// Format: `scheme://[username[:password]@]host[:port]/database`, or
/// `scheme:///absolute/path` for backends rooted in the local filesystem.
/// The scheme names the driver that should open the descriptor.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    scheme: String,
    username: Option<String>,
    password: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: String,
}

impl ConnectionDescriptor {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|e| StoreError::Connection(format!("Invalid connection descriptor '{}': {}", redact(uri), e)))?;

        let username = Some(decode(url.username())?).filter(|u| !u.is_empty());
        let password = url.password().map(decode).transpose()?;
        let host = url.host_str().filter(|h| !h.is_empty()).map(str::to_string);
        let path = decode(url.path())?;

        Ok(Self {
            scheme: url.scheme().to_string(),
            username,
            password,
            host,
            port: url.port(),
            path,
        })
    }

    /// Driver name this descriptor dispatches to.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Both halves of the credentials, when a username is present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.username()
            .map(|user| (user, self.password().unwrap_or_default()))
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Database (namespace) name: the path without its leading slash.
    pub fn database(&self) -> &str {
        self.path.trim_start_matches('/')
    }

    /// Filesystem path for file-rooted backends.
    pub fn fs_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    /// Descriptor text with the password masked.
    pub fn to_redacted_string(&self) -> String {
        let mut out = format!("{}://", self.scheme);
        if let Some(user) = &self.username {
            out.push_str(user);
            if self.password.is_some() {
                out.push_str(":***");
            }
            out.push('@');
        }
        if let Some(host) = &self.host {
            out.push_str(host);
        }
        if let Some(port) = self.port {
            out.push_str(&format!(":{}", port));
        }
        out.push_str(&self.path);
        out
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionDescriptor")
            .field(&self.to_redacted_string())
            .finish()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_redacted_string())
    }
}

fn decode(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| StoreError::Connection(format!("Invalid percent-encoding in descriptor: {}", e)))
}

/// Masks anything between `://` and `@` for use in error messages.
pub(crate) fn redact(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(start), Some(at)) if at > start => format!("{}***{}", &uri[..start + 3], &uri[at..]),
        _ => uri.to_string(),
    }
}
