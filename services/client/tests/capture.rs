mod common;

use httpmock::Method::{POST, PUT};
use httpmock::prelude::HttpMockRequest;
use httpmock::MockServer;
use image::{ImageFormat, RgbImage};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use watchscan_client::config::ThumbnailConfig;
use watchscan_client::{
    ImageNormalizer, ResourceId, ThumbnailCache, UploadError, UploadOrchestrator,
};

fn write_photo(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(width, height, image::Rgb([200, 180, 40]))
        .save_with_format(&path, ImageFormat::Png)
        .unwrap();
    path
}

/// PUT bodies must be JPEGs no larger than 1600px on either side
fn is_bounded_jpeg(req: &HttpMockRequest) -> bool {
    let Some(body) = req.body.as_ref() else {
        return false;
    };
    match image::load_from_memory_with_format(body, ImageFormat::Jpeg) {
        Ok(img) => img.width().max(img.height()) <= 1600,
        Err(_) => false,
    }
}

/// Only the signed headers plus the transport's `host` and `content-length`
fn has_only_signed_headers(req: &HttpMockRequest) -> bool {
    let received: BTreeSet<String> = req
        .headers
        .iter()
        .flatten()
        .map(|(name, _)| name.to_ascii_lowercase())
        .collect();
    let expected: BTreeSet<String> = [
        "content-type",
        "x-amz-meta-origin",
        "x-amz-acl",
        "content-length",
        "host",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    received == expected
}

#[tokio::test]
async fn test_three_photo_capture() {
    let api = MockServer::start_async().await;
    let storage = MockServer::start_async().await;
    let dir = TempDir::new().unwrap();

    let photos = vec![
        write_photo(dir.path(), "front.png", 4000, 3000),
        write_photo(dir.path(), "back.png", 1200, 3200),
        write_photo(dir.path(), "clasp.png", 800, 600),
    ];

    let init = api
        .mock_async(|when, then| {
            when.method(POST)
                .path("/watches/init")
                .header("x-client-id", common::CLIENT_ID)
                .json_body(json!({
                    "count": 3,
                    "contentTypes": ["image/jpeg", "image/jpeg", "image/jpeg"]
                }));
            then.status(200).json_body(json!({
                "resourceId": 11,
                "uploads": (0..3).map(|i| json!({
                    "key": format!("uploads/11/{i}.jpg"),
                    "uploadUrl": storage.url(format!("/bucket/uploads/11/{i}.jpg")),
                    "headers": { "Content-Type": "image/jpeg" }
                })).collect::<Vec<_>>()
            }));
        })
        .await;
    let puts = storage
        .mock_async(|when, then| {
            when.method(PUT)
                .path_contains("/bucket/uploads/11/")
                .header("content-type", "image/jpeg")
                .matches(is_bounded_jpeg);
            then.status(200);
        })
        .await;
    let finalize = api
        .mock_async(|when, then| {
            when.method(POST).path("/watches/11/finalize").json_body(json!({
                "photos": [
                    { "key": "uploads/11/0.jpg" },
                    { "key": "uploads/11/1.jpg" },
                    { "key": "uploads/11/2.jpg" }
                ],
                "analyze": true
            }));
            then.status(200).json_body(json!({
                "id": 11,
                "status": "processing",
                "photos": [
                    { "id": 110, "url": "https://cdn.example/110.jpg?sig=a" },
                    { "id": 111, "url": "https://cdn.example/111.jpg?sig=a" },
                    { "id": 112, "url": "https://cdn.example/112.jpg?sig=a" }
                ]
            }));
        })
        .await;

    let thumbnails = Arc::new(ThumbnailCache::new(
        &ThumbnailConfig::default(),
        Arc::new(common::CountingWarmer::default()),
    ));
    let client = common::api_client(&api, common::session_store().await).await;
    let orchestrator =
        UploadOrchestrator::new(client, ImageNormalizer::new(dir.path().join("tmp"), 75), 1)
            .with_thumbnails(thumbnails.clone());

    let finalized = orchestrator.capture(&photos, 1600).await.unwrap();

    init.assert_hits_async(1).await;
    puts.assert_hits_async(3).await;
    finalize.assert_hits_async(1).await;

    assert_eq!(finalized.resource_id, ResourceId(11));
    assert_eq!(finalized.record.photos.len(), 3);
    assert_eq!(
        thumbnails.get_stable_uri(Some(111), Some("https://cdn.example/111.jpg?sig=b")).as_deref(),
        Some("https://cdn.example/111.jpg?sig=a")
    );

    // Sources stay, normalized temporaries are gone
    assert!(photos.iter().all(|p| p.exists()));
    let leftovers = std::fs::read_dir(dir.path().join("tmp")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_put_carries_exactly_the_signed_headers() {
    let api = MockServer::start_async().await;
    let storage = MockServer::start_async().await;
    let dir = TempDir::new().unwrap();
    let photos = vec![write_photo(dir.path(), "one.png", 64, 64)];

    api.mock_async(|when, then| {
        when.method(POST).path("/watches/init");
        then.status(200).json_body(json!({
            "resourceId": 12,
            "uploads": [{
                "key": "uploads/12/0.jpg",
                "uploadUrl": storage.url("/bucket/uploads/12/0.jpg?X-Amz-Signature=abc"),
                "headers": {
                    "Content-Type": "image/jpeg",
                    "x-amz-meta-origin": "capture",
                    "x-amz-acl": "private"
                }
            }]
        }));
    })
    .await;
    let put = storage
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/bucket/uploads/12/0.jpg")
                .query_param("X-Amz-Signature", "abc")
                .header("content-type", "image/jpeg")
                .header("x-amz-meta-origin", "capture")
                .header("x-amz-acl", "private")
                .header_missing("authorization")
                .header_missing("x-client-id")
                .header_missing("accept")
                .matches(has_only_signed_headers);
            then.status(200);
        })
        .await;
    api.mock_async(|when, then| {
        when.method(POST).path("/watches/12/finalize");
        then.status(200).json_body(json!({ "id": 12 }));
    })
    .await;

    let client = common::api_client(&api, common::session_store().await).await;
    let orchestrator = UploadOrchestrator::new(client, ImageNormalizer::new(dir.path(), 75), 1);

    orchestrator.capture(&photos, 1600).await.unwrap();
    put.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_storage_rejection_surfaces_status() {
    let api = MockServer::start_async().await;
    let storage = MockServer::start_async().await;
    let dir = TempDir::new().unwrap();
    let photos = vec![write_photo(dir.path(), "one.png", 64, 64)];

    api.mock_async(|when, then| {
        when.method(POST).path("/watches/init");
        then.status(200).json_body(json!({
            "resourceId": 13,
            "uploads": [{ "key": "k", "uploadUrl": storage.url("/k"), "headers": {} }]
        }));
    })
    .await;
    storage
        .mock_async(|when, then| {
            when.method(PUT).path("/k");
            then.status(400).body("x".repeat(500));
        })
        .await;

    let client = common::api_client(&api, common::session_store().await).await;
    let orchestrator = UploadOrchestrator::new(client, ImageNormalizer::new(dir.path(), 75), 1);

    let err = orchestrator.capture(&photos, 1600).await.unwrap_err();
    match err {
        UploadError::Api(e) => {
            assert_eq!(e.status(), Some(400));
            assert!(e.to_string().len() < 300);
        }
        other => panic!("unexpected error: {other}"),
    }
}
