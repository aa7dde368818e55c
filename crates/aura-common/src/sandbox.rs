use reqwest::{Client, ClientBuilder};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;
use crate::error::AuraError;

const USER_AGENT: &str = concat!("aura-processor/", env!("CARGO_PKG_VERSION"), " (research terminology)");

/// An HTTP client that only allows requests to approved hosts.
///
/// Every outbound call made by the pipeline (catalog queries, PDF downloads,
/// model inference, Docling) goes through one of these so a misconfigured
/// endpoint cannot reach arbitrary hosts.
#[derive(Debug, Clone)]
pub struct SandboxClient {
    client: Client,
    allowlist: HashSet<String>,
}

impl SandboxClient {
    /// Creates a client with the default allowlist and a 30 s timeout.
    pub fn new() -> Result<Self, AuraError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AuraError> {
        let domains = [
            "export.arxiv.org",                  // arXiv API
            "arxiv.org",                         // arXiv PDFs
            "localhost",                         // Ollama / Docling
            "127.0.0.1",
            "api.openai.com",
            "generativelanguage.googleapis.com", // Gemini
        ];
        let allowlist = domains.iter().map(|d| d.to_string()).collect();

        let client = ClientBuilder::new()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client, allowlist })
    }

    /// Appends an exact hostname to the allowlist.
    pub fn allow_domain(&mut self, domain: &str) {
        self.allowlist.insert(domain.to_string());
    }

    /// Allows the host of a configured endpoint URL (e.g. a remote Ollama box).
    pub fn allow_url_host(&mut self, url: &str) -> Result<(), AuraError> {
        let parsed = Url::parse(url).map_err(|e| AuraError::InvalidUrl(format!("{url}: {e}")))?;
        match parsed.host_str() {
            Some(host) => {
                self.allow_domain(host);
                Ok(())
            }
            None => Err(AuraError::InvalidUrl(format!("{url}: no host"))),
        }
    }

    /// Validates if a URL is permitted under the current sandbox policy.
    pub fn is_allowed(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else { return false };
        let Some(host) = parsed.host_str() else { return false };
        self.allowlist
            .iter()
            .any(|allowed| host == allowed || host.ends_with(&format!(".{allowed}")))
    }

    fn check(&self, url: &str) -> Result<(), AuraError> {
        if self.is_allowed(url) {
            Ok(())
        } else {
            Err(AuraError::Security(format!("domain not in allowlist for URL {url}")))
        }
    }

    pub fn get(&self, url: &str) -> Result<reqwest::RequestBuilder, AuraError> {
        self.check(url)?;
        Ok(self.client.get(url))
    }

    pub fn post(&self, url: &str) -> Result<reqwest::RequestBuilder, AuraError> {
        self.check(url)?;
        Ok(self.client.post(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allowlist() {
        let c = SandboxClient::new().unwrap();
        assert!(c.is_allowed("http://export.arxiv.org/api/query?search_query=cat:cs.AI"));
        assert!(c.is_allowed("https://arxiv.org/pdf/2401.00001v1"));
        assert!(c.is_allowed("http://localhost:11434/api/generate"));
        assert!(!c.is_allowed("https://example.com/file.pdf"));
        assert!(!c.is_allowed("not a url"));
    }

    #[test]
    fn test_subdomain_is_allowed() {
        let c = SandboxClient::new().unwrap();
        assert!(c.is_allowed("https://www.arxiv.org/abs/2401.00001"));
        assert!(!c.is_allowed("https://evilarxiv.org/"));
    }

    #[test]
    fn test_allow_url_host() {
        let mut c = SandboxClient::new().unwrap();
        assert!(!c.is_allowed("http://gpu-box.lan:11434/api/generate"));
        c.allow_url_host("http://gpu-box.lan:11434").unwrap();
        assert!(c.is_allowed("http://gpu-box.lan:11434/api/generate"));
        assert!(c.allow_url_host("nonsense").is_err());
    }

    #[test]
    fn test_blocked_request_errors() {
        let c = SandboxClient::new().unwrap();
        assert!(matches!(c.get("https://example.com/"), Err(AuraError::Security(_))));
    }
}
