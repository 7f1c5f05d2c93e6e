use anyhow::Context;
use std::env;
use std::path::PathBuf;

/// Security and storage configuration for the upload service
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Maximum declared size of a reassembled file in bytes (default: 256 MB)
    pub max_file_size: u64,

    /// Maximum size of a single chunk payload in bytes (default: 16 MB)
    pub max_chunk_size: u64,

    /// Root directory for final artifacts
    pub storage_root: PathBuf,

    /// Chunks and artifacts under assembly. Kept apart from `storage_root`, which
    /// `/uploads` may expose, but on the same filesystem so promotion is a rename.
    pub staging_root: PathBuf,

    /// MIME types accepted after classification. Empty accepts any recognised type.
    pub allowed_mime_types: Vec<String>,

    /// Enable virus scanning (default: true)
    pub enable_virus_scan: bool,

    /// Virus scanner type: "clamav" or "noop" (default: "clamav")
    pub virus_scanner_type: String,

    /// ClamAV host (default: "127.0.0.1")
    pub clamav_host: String,

    /// ClamAV port (default: 3310)
    pub clamav_port: u16,

    /// Upper bound for merge, scan and classification of one completed file
    pub merge_timeout_secs: u64,

    /// Sessions and orphaned chunks idle for longer than this are swept
    pub staging_cleanup_age_hours: u64,

    /// HS256 signing secret for access tokens
    pub jwt_secret: String,

    pub token_ttl_hours: i64,

    /// Public base URL used when building file links
    pub base_url: String,

    /// CORS allowed origins
    pub allowed_origins: Vec<String>,

    /// Serve committed artifacts under `/uploads` without authentication
    pub serve_public_uploads: bool,

    /// Chunk requests allowed per client per minute, 0 disables the limiter
    pub rate_limit_per_minute: u32,

    /// Key the limiter on `X-Forwarded-For` instead of the peer address.
    /// Only safe behind a proxy that overwrites the header.
    pub trust_forwarded_for: bool,
}

fn default_allowed_mime_types() -> Vec<String> {
    [
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "image/bmp",
        "image/tiff",
        "application/pdf",
        "audio/mpeg",
        "audio/ogg",
        "audio/x-wav",
        "audio/x-flac",
        "video/mp4",
        "video/webm",
        "video/quicktime",
        "video/x-matroska",
        "application/zip",
        "application/gzip",
        "application/x-7z-compressed",
        "application/x-tar",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn localhost_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(), // Vite default
        "http://127.0.0.1:3000".to_string(),
    ]
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_flag(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    value != "false" && value != "0" && value != "no"
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_file_size: 256 * 1024 * 1024, // 256 MB
            max_chunk_size: 16 * 1024 * 1024, // 16 MB
            storage_root: PathBuf::from("./uploads"),
            staging_root: PathBuf::from("./staging"),
            allowed_mime_types: default_allowed_mime_types(),
            enable_virus_scan: true,
            virus_scanner_type: "clamav".to_string(),
            clamav_host: "127.0.0.1".to_string(),
            clamav_port: 3310,
            merge_timeout_secs: 300,
            staging_cleanup_age_hours: 24,
            jwt_secret: "secret".to_string(),
            token_ttl_hours: 24,
            base_url: "http://localhost:3000".to_string(),
            allowed_origins: localhost_origins(),
            serve_public_uploads: false,
            rate_limit_per_minute: 200,
            trust_forwarded_for: false,
        }
    }
}

impl SecurityConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::overlay(Self::default(), |key| env::var(key).ok())
    }

    /// Create config for development (no virus scanning, relaxed limits)
    pub fn development() -> Self {
        Self {
            enable_virus_scan: false,
            virus_scanner_type: "noop".to_string(),
            staging_cleanup_age_hours: 1,
            ..Self::default()
        }
    }

    /// Create config for production (strict security). `JWT_SECRET` must be set.
    pub fn production() -> anyhow::Result<Self> {
        Self::production_from(|key| env::var(key).ok())
    }

    fn production_from(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let secret = lookup("JWT_SECRET")
            .filter(|s| !s.trim().is_empty())
            .context("JWT_SECRET must be set in production")?;

        let base = Self {
            jwt_secret: secret,
            enable_virus_scan: true,
            virus_scanner_type: "clamav".to_string(),
            allowed_origins: Vec::new(),
            ..Self::default()
        };

        Ok(Self::overlay(base, lookup))
    }

    /// Applies every recognised variable from `lookup` on top of `base`.
    fn overlay(base: Self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            max_file_size: lookup("MAX_FILE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.max_file_size),

            max_chunk_size: lookup("MAX_CHUNK_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.max_chunk_size),

            storage_root: lookup("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(base.storage_root),

            staging_root: lookup("STAGING_ROOT")
                .map(PathBuf::from)
                .unwrap_or(base.staging_root),

            allowed_mime_types: lookup("ALLOWED_MIME_TYPES")
                .map(|v| split_list(&v))
                .unwrap_or(base.allowed_mime_types),

            enable_virus_scan: lookup("ENABLE_VIRUS_SCAN")
                .map(|v| parse_flag(&v))
                .unwrap_or(base.enable_virus_scan),

            virus_scanner_type: lookup("VIRUS_SCANNER_TYPE").unwrap_or(base.virus_scanner_type),

            clamav_host: lookup("CLAMAV_HOST").unwrap_or(base.clamav_host),

            clamav_port: lookup("CLAMAV_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.clamav_port),

            merge_timeout_secs: lookup("MERGE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.merge_timeout_secs),

            staging_cleanup_age_hours: lookup("STAGING_CLEANUP_AGE_HOURS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.staging_cleanup_age_hours),

            jwt_secret: lookup("JWT_SECRET").unwrap_or(base.jwt_secret),

            token_ttl_hours: lookup("TOKEN_TTL_HOURS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.token_ttl_hours),

            base_url: lookup("BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(base.base_url),

            allowed_origins: lookup("ALLOWED_ORIGINS")
                .map(|v| split_list(&v))
                .unwrap_or(base.allowed_origins),

            serve_public_uploads: lookup("SERVE_PUBLIC_UPLOADS")
                .map(|v| v.trim().eq_ignore_ascii_case("true") || v.trim() == "1")
                .unwrap_or(base.serve_public_uploads),

            rate_limit_per_minute: lookup("RATE_LIMIT_PER_MINUTE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.rate_limit_per_minute),

            trust_forwarded_for: lookup("TRUST_FORWARDED_FOR")
                .map(|v| v.trim().eq_ignore_ascii_case("true") || v.trim() == "1")
                .unwrap_or(base.trust_forwarded_for),
        }
    }

    /// Directory where in-flight chunks are staged
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_root.clone()
    }

    /// Staging must never be reachable through the public `/uploads` tree.
    pub fn staging_is_exposed(&self) -> bool {
        self.serve_public_uploads && self.staging_root.starts_with(&self.storage_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = SecurityConfig::default();
        assert_eq!(config.max_file_size, 256 * 1024 * 1024);
        assert_eq!(config.max_chunk_size, 16 * 1024 * 1024);
        assert!(config.enable_virus_scan);
        assert_eq!(config.virus_scanner_type, "clamav");
        assert_eq!(config.merge_timeout_secs, 300);
        assert!(config.allowed_mime_types.contains(&"application/pdf".to_string()));
        assert!(!config.serve_public_uploads);
        assert_eq!(config.rate_limit_per_minute, 200);
        assert!(!config.staging_dir().starts_with(&config.storage_root));
    }

    #[test]
    fn test_development_config() {
        let config = SecurityConfig::development();
        assert!(!config.enable_virus_scan);
        assert_eq!(config.virus_scanner_type, "noop");
    }

    #[test]
    fn test_production_config() {
        let config =
            SecurityConfig::production_from(lookup_from(&[("JWT_SECRET", "test_secret")])).unwrap();
        assert!(config.enable_virus_scan);
        assert_eq!(config.virus_scanner_type, "clamav");
        assert_eq!(config.jwt_secret, "test_secret");
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn test_production_requires_secret() {
        assert!(SecurityConfig::production_from(lookup_from(&[])).is_err());
        assert!(SecurityConfig::production_from(lookup_from(&[("JWT_SECRET", "  ")])).is_err());
    }

    #[test]
    fn test_overlay_parses_values() {
        let config = SecurityConfig::overlay(
            SecurityConfig::default(),
            lookup_from(&[
                ("MAX_CHUNK_SIZE", "1024"),
                ("ALLOWED_MIME_TYPES", "image/png, application/pdf,"),
                ("ENABLE_VIRUS_SCAN", "0"),
                ("BASE_URL", "https://files.example.com/"),
                ("SERVE_PUBLIC_UPLOADS", "true"),
                ("CLAMAV_PORT", "not-a-port"),
                ("STAGING_ROOT", "/var/lib/uploads-staging"),
                ("RATE_LIMIT_PER_MINUTE", "0"),
                ("TRUST_FORWARDED_FOR", "1"),
            ]),
        );
        assert_eq!(config.max_chunk_size, 1024);
        assert_eq!(config.allowed_mime_types, vec!["image/png", "application/pdf"]);
        assert!(!config.enable_virus_scan);
        assert_eq!(config.base_url, "https://files.example.com");
        assert!(config.serve_public_uploads);
        assert_eq!(config.clamav_port, 3310);
        assert_eq!(config.staging_dir(), PathBuf::from("/var/lib/uploads-staging"));
        assert_eq!(config.rate_limit_per_minute, 0);
        assert!(config.trust_forwarded_for);
    }

    #[test]
    fn test_staging_inside_public_root_is_flagged() {
        let mut config = SecurityConfig {
            serve_public_uploads: true,
            ..SecurityConfig::default()
        };
        assert!(!config.staging_is_exposed());

        config.staging_root = config.storage_root.join("temp");
        assert!(config.staging_is_exposed());

        config.serve_public_uploads = false;
        assert!(!config.staging_is_exposed());
    }

    #[test]
    fn test_cors_fallback() {
        let config = SecurityConfig::overlay(SecurityConfig::default(), lookup_from(&[]));
        assert_eq!(config.allowed_origins, localhost_origins());
        assert!(!config.allowed_origins.contains(&"*".to_string()));
    }
}
