//! SHA-256 helpers used for per-chunk integrity checks and whole-file digests.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

pub fn calculate_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub async fn calculate_hash_from_reader<R: AsyncRead + Unpin>(
    mut reader: R,
) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Consumes `reader` and compares its digest against `expected_hex`.
///
/// The comparison is exact: the expected value must be lower-case hex.
/// A mismatch is `Ok(false)`; only a read failure is an error.
pub async fn verify<R: AsyncRead + Unpin>(reader: R, expected_hex: &str) -> std::io::Result<bool> {
    let actual = calculate_hash_from_reader(reader).await?;
    Ok(actual == expected_hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_calculate_hash() {
        let hash = calculate_hash(b"hello world");
        assert_eq!(hash, HELLO_WORLD);
    }

    #[tokio::test]
    async fn test_calculate_hash_from_reader() {
        let data = b"hello world";
        let hash = calculate_hash_from_reader(&data[..]).await.unwrap();
        assert_eq!(hash, HELLO_WORLD);
    }

    #[test]
    fn test_calculate_hash_empty() {
        let hash = calculate_hash(b"");
        // SHA-256 for empty string
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_verify() {
        assert!(verify(&b"hello world"[..], HELLO_WORLD).await.unwrap());
        assert!(!verify(&b"hello worle"[..], HELLO_WORLD).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_is_case_sensitive() {
        let upper = HELLO_WORLD.to_uppercase();
        assert!(!verify(&b"hello world"[..], &upper).await.unwrap());
        assert!(!verify(&b"hello world"[..], "").await.unwrap());
    }
}
