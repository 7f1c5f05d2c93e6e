mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{body_json, chunk_request, png_bytes, spawn_app, split, text_bytes};

#[tokio::test]
async fn test_checksum_mismatch_is_rejected() {
    let app = spawn_app().await;
    let token = app.register("alice@example.com").await;

    let data = png_bytes(20_000);
    let mut chunks = split("tampered", "photo.png", &data, 2);
    chunks[1].bytes[0] ^= 0xFF;

    app.upload(&token, &chunks[0]).await;
    let response = app.upload(&token, &chunks[1]).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body_json(response).await["error"].is_string());

    // Only the good chunk is staged and nothing was committed
    assert_eq!(app.staged_files().len(), 1);
    let list = body_json(app.get("/api/file", &token).await).await;
    assert!(list.as_array().unwrap().is_empty());
    let uploads = body_json(app.get("/api/file/uploads", &token).await).await;
    assert_eq!(uploads[0]["receivedChunks"], 1);
}

#[tokio::test]
async fn test_disallowed_type_leaves_nothing_behind() {
    let app = spawn_app().await;
    let token = app.register("alice@example.com").await;

    let data = text_bytes(20_000);
    let chunks = split("notes", "notes.png", &data, 2);

    app.upload(&token, &chunks[0]).await;
    let response = app.upload(&token, &chunks[1]).await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let list = body_json(app.get("/api/file", &token).await).await;
    assert!(list.as_array().unwrap().is_empty());
    let uploads = body_json(app.get("/api/file/uploads", &token).await).await;
    assert!(uploads.as_array().unwrap().is_empty());
    assert!(app.is_disk_empty());
}

#[tokio::test]
async fn test_recognised_but_unlisted_type_is_rejected() {
    let app = spawn_app_only_pdf().await;
    let token = app.register("alice@example.com").await;

    let data = png_bytes(5_000);
    let chunks = split("img", "photo.png", &data, 1);

    let response = app.upload(&token, &chunks[0]).await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert!(app.is_disk_empty());
}

async fn spawn_app_only_pdf() -> common::TestApp {
    common::spawn_app_with(
        |config| config.allowed_mime_types = vec!["application/pdf".to_string()],
        std::sync::Arc::new(chunked_upload_backend::services::scanner::NoOpScanner),
    )
    .await
}

#[tokio::test]
async fn test_requests_without_valid_token_are_unauthorized() {
    let app = spawn_app().await;

    let response = app
        .send(
            Request::builder()
                .uri("/api/file")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.get("/api/file", "not-a-jwt").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let data = png_bytes(1_000);
    let chunks = split("anon", "photo.png", &data, 1);
    let response = app.send(chunk_request("garbage", &chunks[0])).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(app.is_disk_empty());
}

#[tokio::test]
async fn test_other_users_files_are_invisible() {
    let app = spawn_app().await;
    let alice = app.register("alice@example.com").await;
    let bob = app.register("bob@example.com").await;

    let data = png_bytes(10_000);
    let chunks = split("private", "photo.png", &data, 1);
    let body = body_json(app.upload(&alice, &chunks[0]).await).await;
    let id = body["file"]["id"].as_i64().unwrap();

    for uri in [
        format!("/api/file/metadata/{}", id),
        format!("/api/file/download/{}", id),
    ] {
        assert_eq!(app.get(&uri, &bob).await.status(), StatusCode::NOT_FOUND);
    }
    assert_eq!(
        app.delete(&format!("/api/file/{}", id), &bob).await.status(),
        StatusCode::NOT_FOUND
    );
    let list = body_json(app.get("/api/file", &bob).await).await;
    assert!(list.as_array().unwrap().is_empty());

    // Still intact for the owner
    let response = app
        .get(&format!("/api/file/download/{}", id), &alice)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_foreign_file_id_is_not_hijacked() {
    let app = spawn_app().await;
    let alice = app.register("alice@example.com").await;
    let bob = app.register("bob@example.com").await;

    let data = png_bytes(20_000);
    let chunks = split("shared-id", "photo.png", &data, 2);
    app.upload(&alice, &chunks[0]).await;

    let response = app.upload(&bob, &chunks[1]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Alice can still finish her upload
    let body = body_json(app.upload(&alice, &chunks[1]).await).await;
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn test_invalid_metadata_is_rejected() {
    let app = spawn_app().await;
    let token = app.register("alice@example.com").await;

    let data = png_bytes(20_000);
    let base = split("valid-id", "photo.png", &data, 2);

    // Path traversal in the file id
    let mut chunk = base[0].clone();
    chunk.file_id = "../../etc".to_string();
    let response = app.upload(&token, &chunk).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_FILE_ID");

    // Range past the end of the file
    let mut chunk = base[1].clone();
    chunk.limit = chunk.file_size + 1;
    let response = app.upload(&token, &chunk).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Declared range disagrees with the payload
    let mut chunk = base[0].clone();
    chunk.bytes.truncate(100);
    chunk.check_sum = chunked_upload_backend::utils::hash::calculate_hash(&chunk.bytes);
    let response = app.upload(&token, &chunk).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Declared file size changes mid-upload
    app.upload(&token, &base[0]).await;
    let mut chunk = base[1].clone();
    chunk.file_size += 1;
    let response = app.upload(&token, &chunk).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Larger than the configured maximum
    let mut chunk = base[0].clone();
    chunk.file_id = "huge".to_string();
    chunk.file_size = app.state.config.max_file_size + 1;
    let response = app.upload(&token, &chunk).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert_eq!(app.staged_files().len(), 1);
}

#[tokio::test]
async fn test_oversized_chunk_is_rejected() {
    let app = spawn_app().await;
    let token = app.register("alice@example.com").await;

    let limit = app.state.config.max_chunk_size as usize;
    let data = png_bytes(limit + 1);
    let chunks = split("big", "photo.png", &data, 1);

    let response = app.upload(&token, &chunks[0]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.staged_files().is_empty());
}

#[tokio::test]
async fn test_registration_rules() {
    let app = spawn_app().await;
    app.register("alice@example.com").await;

    let post = |body: serde_json::Value, uri: &'static str| {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    };

    let response = app
        .send(post(
            serde_json::json!({ "email": "ALICE@example.com", "password": "password123" }),
            "/api/register",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .send(post(
            serde_json::json!({ "email": "not-an-email", "password": "password123" }),
            "/api/register",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(post(
            serde_json::json!({ "email": "alice@example.com", "password": "wrong-password" }),
            "/api/login",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .send(post(
            serde_json::json!({ "email": "alice@example.com", "password": "password123" }),
            "/api/login",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["token"].is_string());
}

#[tokio::test]
async fn test_trace_is_refused() {
    let app = spawn_app().await;
    let response = app
        .send(
            Request::builder()
                .method("TRACE")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_chunk_route_is_rate_limited_per_client() {
    use axum::extract::ConnectInfo;
    use std::net::SocketAddr;

    let app = common::spawn_app_with(
        |config| config.rate_limit_per_minute = 3,
        std::sync::Arc::new(chunked_upload_backend::services::scanner::NoOpScanner),
    )
    .await;
    let token = app.register("alice@example.com").await;

    let data = png_bytes(50_000);
    let chunks = split("throttled", "photo.png", &data, 5);
    let from = |chunk: &common::Chunk, peer: &str| {
        let mut request = chunk_request(&token, chunk);
        request
            .extensions_mut()
            .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        request
    };

    for chunk in &chunks[..3] {
        let response = app.send(from(chunk, "198.51.100.7:40000")).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = app.send(from(&chunks[3], "198.51.100.7:40001")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    assert!(body_json(response).await["error"].is_string());

    // Another address has its own budget
    let response = app.send(from(&chunks[3], "198.51.100.8:40000")).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    // Only the chunk route is limited
    let response = app.get("/api/file/uploads", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_conflicts_cleanly() {
    let app = spawn_app().await;

    let requests = (0..8).map(|_| {
        let request = Request::builder()
            .method("POST")
            .uri("/api/register")
            .header("Content-Type", "application/json")
            .body(Body::from(
                serde_json::json!({ "email": "race@example.com", "password": "password123" })
                    .to_string(),
            ))
            .unwrap();
        app.send(request)
    });
    let statuses: Vec<StatusCode> = futures::future::join_all(requests)
        .await
        .into_iter()
        .map(|r| r.status())
        .collect();

    let created = statuses.iter().filter(|s| **s == StatusCode::CREATED).count();
    let conflicts = statuses.iter().filter(|s| **s == StatusCode::CONFLICT).count();
    assert_eq!(created, 1, "statuses: {:?}", statuses);
    assert_eq!(conflicts, statuses.len() - 1, "statuses: {:?}", statuses);
}
