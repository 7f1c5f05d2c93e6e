use std::path::Path;
use thiserror::Error;

/// Longest accepted client-generated upload id
pub const MAX_FILE_ID_LEN: usize = 128;

/// Dangerous file extensions that should never be stored
const BLOCKED_EXTENSIONS: &[&str] = &[
    // Executables
    "exe", "dll", "so", "dylib", "bin", "com", "bat", "cmd", "ps1", "sh", "bash", "msi",
    // Scripts
    "js", "py", "pyw", "rb", "php", "pl", "cgi", "asp", "aspx", "jsp", "vbs",
    // Web
    "html", "htm", "xhtml", "shtml", "svg",
    // Server config
    "htaccess", "htpasswd",
    // Macro-enabled documents
    "docm", "xlsm", "pptm",
];

#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Upload ids become part of staging file names, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_file_id(file_id: &str) -> Result<(), ValidationError> {
    if file_id.is_empty() || file_id.len() > MAX_FILE_ID_LEN {
        return Err(ValidationError::new(
            "INVALID_FILE_ID",
            format!("fileId must be 1 to {} characters", MAX_FILE_ID_LEN),
        ));
    }
    if !file_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::new(
            "INVALID_FILE_ID",
            "fileId may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

/// Validates file size against maximum limit
pub fn validate_file_size(size: u64, max_size: u64) -> Result<(), ValidationError> {
    if size > max_size {
        return Err(ValidationError::new(
            "FILE_TOO_LARGE",
            format!(
                "File size {} bytes exceeds maximum allowed {} bytes ({} MB)",
                size,
                max_size,
                max_size / 1024 / 1024
            ),
        ));
    }
    Ok(())
}

/// Checks a detected MIME type against the configured allow-list.
/// An empty allow-list accepts every type.
pub fn is_mime_allowed(mime: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let normalized = mime
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();
    allowed.iter().any(|a| a.eq_ignore_ascii_case(&normalized))
}

/// Sanitizes filename to prevent path traversal and injection attacks
/// Returns the sanitized filename or an error if the name is invalid
pub fn sanitize_filename(filename: &str) -> Result<String, ValidationError> {
    // Normalise Windows separators so the last component is taken on every platform
    let unified = filename.replace('\\', "/");
    let name = Path::new(&unified)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    if name.is_empty() {
        return Err(ValidationError::new(
            "INVALID_FILENAME",
            "Filename cannot be empty",
        ));
    }

    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        tracing::warn!("Path traversal attempt detected: {}", filename);
    }

    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ';' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    // Limit length safely for UTF-8
    let sanitized = if sanitized.len() > 255 {
        let mut end = 255;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    };

    if let Some(ext) = Path::new(&sanitized).extension().and_then(|e| e.to_str()) {
        let ext_lower = ext.to_lowercase();
        if BLOCKED_EXTENSIONS.contains(&ext_lower.as_str()) {
            return Err(ValidationError::new(
                "BLOCKED_EXTENSION",
                format!("File extension '.{}' is not allowed", ext_lower),
            ));
        }
    }

    if sanitized.starts_with('.') {
        return Err(ValidationError::new(
            "HIDDEN_FILE",
            "Hidden files (starting with '.') are not allowed",
        ));
    }

    Ok(sanitized)
}
