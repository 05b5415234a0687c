use super::ReadinessProbe;
use crate::error::{Result, StackError};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;

/// Ready once a GET returns a 2xx status
pub struct HttpProbe {
    url: Url,
    client: Client,
    timeout: Duration,
}

impl HttpProbe {
    /// Create a probe; the URL must be http or https
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| StackError::InvalidConfig(format!("Invalid probe URL '{}': {}", url, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(StackError::InvalidConfig(format!(
                "Invalid probe URL '{}': scheme must be http or https",
                url
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StackError::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url,
            client,
            timeout,
        })
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    async fn check(&self) -> Result<bool> {
        match self.client.get(self.url.clone()).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::trace!(url = %self.url, error = %e, "http probe request failed");
                Ok(false)
            }
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn describe(&self) -> String {
        format!("http: {}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_scheme() {
        assert!(HttpProbe::new("ftp://localhost:21/", Duration::from_secs(1)).is_err());
        assert!(HttpProbe::new("not a url", Duration::from_secs(1)).is_err());
        assert!(HttpProbe::new("http://localhost:9200/_cluster/health", Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_is_not_ready() {
        // Port 9 (discard) is closed on test machines
        let probe = HttpProbe::new("http://127.0.0.1:9/", Duration::from_millis(500)).unwrap();
        assert!(!probe.check().await.unwrap());
    }
}
