#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use chunked_upload_backend::config::SecurityConfig;
use chunked_upload_backend::infrastructure::database;
use chunked_upload_backend::services::scanner::{NoOpScanner, VirusScanner};
use chunked_upload_backend::utils::hash::calculate_hash;
use chunked_upload_backend::{AppState, create_app};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "----chunked-upload-test-boundary";

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub storage_root: PathBuf,
    _dir: TempDir,
}

pub fn test_config(root: &Path) -> SecurityConfig {
    SecurityConfig {
        storage_root: root.join("uploads"),
        staging_root: root.join("staging"),
        max_chunk_size: 64 * 1024,
        allowed_mime_types: vec!["image/png".to_string(), "application/pdf".to_string()],
        jwt_secret: "integration-test-secret".to_string(),
        base_url: "http://files.test".to_string(),
        ..SecurityConfig::development()
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(|_| {}, Arc::new(NoOpScanner)).await
}

pub async fn spawn_app_with(
    customize: impl FnOnce(&mut SecurityConfig),
    scanner: Arc<dyn VirusScanner>,
) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
    let db = database::connect(&url).await.unwrap();

    let mut config = test_config(dir.path());
    customize(&mut config);
    let storage_root = config.storage_root.clone();

    let state = AppState::build(db, config, scanner).await.unwrap();
    TestApp {
        app: create_app(state.clone()),
        state,
        storage_root,
        _dir: dir,
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    /// Registers a fresh account and returns its token.
    pub async fn register(&self, email: &str) -> String {
        let response = self
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/api/register")
                    .header("Content-Type", "application/json")
                    .body(Body::from(
                        json!({ "email": email, "password": "password123" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await["token"]
            .as_str()
            .unwrap()
            .to_string()
    }

    pub async fn get(&self, uri: &str, token: &str) -> Response {
        self.send(
            Request::builder()
                .uri(uri)
                .header("Authorization", format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn delete(&self, uri: &str, token: &str) -> Response {
        self.send(
            Request::builder()
                .method("DELETE")
                .uri(uri)
                .header("Authorization", format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn upload(&self, token: &str, chunk: &Chunk) -> Response {
        self.send(chunk_request(token, chunk)).await
    }

    /// Uploads every chunk in order and returns the last response.
    pub async fn upload_all(&self, token: &str, chunks: &[Chunk]) -> Response {
        let mut last = None;
        for chunk in chunks {
            last = Some(self.upload(token, chunk).await);
        }
        last.unwrap()
    }

    /// Promoted artifacts below the storage root.
    pub fn stored_files(&self) -> Vec<PathBuf> {
        files_under(&self.storage_root)
    }

    /// Chunks and temporary artifacts in the staging directory.
    pub fn staged_files(&self) -> Vec<PathBuf> {
        files_under(&self.state.config.staging_dir())
    }

    /// True when neither storage nor staging holds anything.
    pub fn is_disk_empty(&self) -> bool {
        self.stored_files().is_empty() && self.staged_files().is_empty()
    }
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, out);
            } else {
                out.push(path);
            }
        }
    }
    let mut out = Vec::new();
    walk(dir, &mut out);
    out
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub file_id: String,
    pub order: u64,
    pub offset: u64,
    pub limit: u64,
    pub file_size: u64,
    pub file_name: String,
    pub check_sum: String,
    pub bytes: Vec<u8>,
}

impl Chunk {
    pub fn metadata(&self) -> Value {
        json!({
            "order": self.order,
            "fileId": self.file_id,
            "offset": self.offset,
            "limit": self.limit,
            "fileSize": self.file_size,
            "fileName": self.file_name,
            "checkSum": self.check_sum,
        })
    }
}

/// Splits `data` into `count` contiguous chunks with correct checksums.
pub fn split(file_id: &str, file_name: &str, data: &[u8], count: usize) -> Vec<Chunk> {
    let size = data.len();
    let step = size.div_ceil(count);
    data.chunks(step)
        .enumerate()
        .map(|(order, bytes)| {
            let offset = order * step;
            Chunk {
                file_id: file_id.to_string(),
                order: order as u64,
                offset: offset as u64,
                limit: (offset + bytes.len()) as u64,
                file_size: size as u64,
                file_name: file_name.to_string(),
                check_sum: calculate_hash(bytes),
                bytes: bytes.to_vec(),
            }
        })
        .collect()
}

/// A PNG signature followed by filler; enough for content sniffing.
pub fn png_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    data.extend((0..len.saturating_sub(8)).map(|i| (i % 251) as u8));
    data
}

/// Plain text; no magic number anything recognises.
pub fn text_bytes(len: usize) -> Vec<u8> {
    b"just some plain text that no sniffer recognises. "
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

pub fn chunk_request(token: &str, chunk: &Chunk) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"metadata\"\r\n\r\n{}\r\n",
            chunk.metadata()
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(&chunk.bytes);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/file/upload-chunk")
        .header("Authorization", format!("Bearer {}", token))
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
