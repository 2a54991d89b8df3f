//! HTTP gateway adapter.
//!
//! The gateway contract is minimal: `POST <base>/upload` with the raw blob
//! returns the blob's permanent URL as the response body; `GET <url>` returns
//! the blob. Tags travel as `x-tag-*` request headers.

use std::io::Read;
use std::time::Duration;

use super::RemoteStore;
use crate::error::{DustError, Result};

pub struct HttpRemote {
    base_url: String,
    agent: ureq::Agent,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
            token: token.map(|t| t.to_string()),
        }
    }

    fn apply_auth(&self, req: ureq::Request) -> ureq::Request {
        if let Some(ref token) = self.token {
            req.set("Authorization", &format!("Bearer {token}"))
        } else {
            req
        }
    }

    /// Map a ureq failure onto the engine's transient/fatal split: transport
    /// errors and 429/5xx are worth retrying, everything else is not.
    fn classify(op: &str, err: ureq::Error) -> DustError {
        match err {
            ureq::Error::Transport(t) => DustError::RemoteTransient(format!("{op}: {t}")),
            ureq::Error::Status(code, _) if code == 429 || code >= 500 => {
                DustError::RemoteTransient(format!("{op}: HTTP {code}"))
            }
            ureq::Error::Status(code, _) => DustError::Remote(format!("{op}: HTTP {code}")),
        }
    }
}

impl RemoteStore for HttpRemote {
    fn put(&self, blob: &[u8], tags: &[(&str, &str)]) -> Result<String> {
        let url = format!("{}/upload", self.base_url);
        let mut req = self
            .apply_auth(self.agent.post(&url))
            .set("Content-Type", "application/octet-stream");
        for (name, value) in tags {
            req = req.set(&format!("x-tag-{name}"), value);
        }

        let resp = req
            .send_bytes(blob)
            .map_err(|e| Self::classify("PUT", e))?;
        let blob_url = resp
            .into_string()
            .map_err(|e| DustError::RemoteTransient(format!("PUT: reading response: {e}")))?
            .trim()
            .to_string();
        if blob_url.is_empty() {
            return Err(DustError::Remote("PUT: gateway returned no URL".into()));
        }
        Ok(blob_url)
    }

    fn get(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .apply_auth(self.agent.get(url))
            .call()
            .map_err(|e| Self::classify("GET", e))?;

        let mut blob = Vec::new();
        resp.into_reader()
            .read_to_end(&mut blob)
            .map_err(|e| DustError::RemoteTransient(format!("GET: reading body: {e}")))?;
        Ok(blob)
    }
}
