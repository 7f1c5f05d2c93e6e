use anyhow::{Result, anyhow};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::SecurityConfig;

/// Result of a virus scan
#[derive(Debug, Clone, PartialEq)]
pub enum ScanResult {
    /// File is clean (no threats detected)
    Clean,
    /// File is infected with malware
    Infected { threat_name: String },
    /// Scan could not be completed
    Error { reason: String },
}

/// Trait for virus scanning implementations
#[async_trait::async_trait]
pub trait VirusScanner: Send + Sync {
    /// Scan file content for malware using a stream
    async fn scan(&self, reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult>;

    /// Check if the scanner is available/healthy
    async fn health_check(&self) -> bool;
}

/// ClamAV scanner speaking the clamd TCP protocol
///
/// Docker command to run ClamAV:
/// ```bash
/// docker run -d --name clamav -p 3310:3310 clamav/clamav:latest
/// ```
pub struct ClamAvScanner {
    host: String,
    port: u16,
    response_timeout: Duration,
}

impl ClamAvScanner {
    /// clamd's default StreamMaxLength is 25 MB; frames stay well below it
    const FRAME_SIZE: usize = 256 * 1024;

    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            response_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        TcpStream::connect(&addr)
            .await
            .map_err(|e| anyhow!("Failed to connect to ClamAV at {}: {}", addr, e))
    }
}

/// Parses a clamd reply such as `stream: OK` or `stream: Eicar-Signature FOUND`.
pub fn parse_clamd_response(raw: &[u8]) -> ScanResult {
    let response = String::from_utf8_lossy(raw);
    let response = response.trim_end_matches('\0').trim();

    if response.ends_with("OK") {
        ScanResult::Clean
    } else if let Some(body) = response.strip_suffix("FOUND") {
        let threat = body
            .split_once(':')
            .map(|(_, t)| t)
            .unwrap_or(body)
            .trim();
        ScanResult::Infected {
            threat_name: if threat.is_empty() {
                "Unknown threat".to_string()
            } else {
                threat.to_string()
            },
        }
    } else if response.contains("ERROR") {
        ScanResult::Error {
            reason: response.to_string(),
        }
    } else {
        ScanResult::Error {
            reason: format!("Unexpected ClamAV response: {}", response),
        }
    }
}

#[async_trait::async_trait]
impl VirusScanner for ClamAvScanner {
    async fn scan(&self, mut reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult> {
        let mut stream = self.connect().await?;

        // Format: zINSTREAM\0 <length:u32 big-endian> <data> ... <0:u32>
        stream.write_all(b"zINSTREAM\0").await?;

        let mut buffer = vec![0u8; Self::FRAME_SIZE];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }

            let len = (n as u32).to_be_bytes();
            stream.write_all(&len).await?;
            stream.write_all(&buffer[..n]).await?;
        }

        // Zero-length frame ends the stream
        stream.write_all(&0u32.to_be_bytes()).await?;
        stream.flush().await?;

        let mut response = Vec::new();
        tokio::time::timeout(self.response_timeout, stream.read_to_end(&mut response))
            .await
            .map_err(|_| anyhow!("ClamAV scan timed out after {:?}", self.response_timeout))??;

        let result = parse_clamd_response(&response);
        tracing::debug!("ClamAV response: {:?}", result);
        Ok(result)
    }

    async fn health_check(&self) -> bool {
        let Ok(mut stream) = self.connect().await else {
            return false;
        };
        if stream.write_all(b"zPING\0").await.is_err() || stream.flush().await.is_err() {
            return false;
        }

        let mut response = [0u8; 16];
        match stream.read(&mut response).await {
            Ok(n) => String::from_utf8_lossy(&response[..n]).contains("PONG"),
            Err(_) => false,
        }
    }
}

/// No-op scanner for development/testing
pub struct NoOpScanner;

#[async_trait::async_trait]
impl VirusScanner for NoOpScanner {
    async fn scan(&self, _reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult> {
        tracing::warn!("NoOpScanner: Skipping virus scan (development mode)");
        Ok(ScanResult::Clean)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Factory function to create appropriate scanner based on config
pub fn create_scanner(config: &SecurityConfig) -> Box<dyn VirusScanner> {
    match config.virus_scanner_type.to_lowercase().as_str() {
        "clamav" => Box::new(ClamAvScanner::new(
            config.clamav_host.clone(),
            config.clamav_port,
        )),
        "noop" | "none" | "disabled" => Box::new(NoOpScanner),
        other => {
            tracing::warn!("Unknown scanner type '{}', using NoOpScanner", other);
            Box::new(NoOpScanner)
        }
    }
}
