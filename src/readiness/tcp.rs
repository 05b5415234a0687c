use super::ReadinessProbe;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Ready once a TCP connection to the address succeeds
pub struct TcpProbe {
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn check(&self) -> Result<bool> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(_)) | Err(_) => Ok(false),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn describe(&self) -> String {
        format!("tcp: {}", self.address)
    }
}
