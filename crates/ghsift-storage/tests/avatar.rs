use std::time::Duration;

use ghsift_core::Candidate;
use ghsift_storage::{ArtifactFetcher, AvatarFetcher, AvatarFetcherConfig, BackoffPolicy};
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn candidate(avatar_url: &str) -> Candidate {
    serde_json::from_value(serde_json::json!({
        "id": 42,
        "name": "okhttp",
        "full_name": "square/okhttp",
        "owner": { "login": "square", "avatar_url": avatar_url }
    }))
    .expect("candidate")
}

fn fetcher(images_dir: std::path::PathBuf) -> AvatarFetcher {
    AvatarFetcher::new(AvatarFetcherConfig {
        images_dir,
        timeout: Duration::from_secs(5),
        user_agent: Some("ghsift-test".to_string()),
        backoff: BackoffPolicy::none(),
    })
    .expect("fetcher")
}

#[tokio::test]
async fn successful_download_rewrites_avatar_to_local_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/u/82592"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"\x89PNG-bytes".to_vec(), "image/png"))
        .mount(&server)
        .await;

    let dir = tempdir().expect("tempdir");
    let images = dir.path().join("images");
    let fetcher = fetcher(images.clone());
    let mut c = candidate(&format!("{}/u/82592", server.uri()));

    assert!(fetcher.enrich(&mut c).await);

    let local = images.join("square");
    assert_eq!(c.owner.avatar_url.as_deref(), Some(local.display().to_string().as_str()));
    assert_eq!(std::fs::read(&local).expect("avatar file"), b"\x89PNG-bytes");
}

#[tokio::test]
async fn existing_images_dir_is_fine() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"img".to_vec(), "image/jpeg"))
        .mount(&server)
        .await;

    let dir = tempdir().expect("tempdir");
    let fetcher = fetcher(dir.path().to_path_buf());
    let mut c = candidate(&format!("{}/avatar", server.uri()));

    assert!(fetcher.enrich(&mut c).await);
    assert!(dir.path().join("square").exists());
}

#[tokio::test]
async fn http_error_leaves_avatar_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempdir().expect("tempdir");
    let images = dir.path().join("images");
    let fetcher = fetcher(images.clone());
    let original = format!("{}/missing", server.uri());
    let mut c = candidate(&original);

    assert!(!fetcher.enrich(&mut c).await);
    assert_eq!(c.owner.avatar_url.as_deref(), Some(original.as_str()));
    assert!(!images.join("square").exists());
}

#[tokio::test]
async fn network_error_is_swallowed() {
    let server = MockServer::start().await;
    let original = format!("{}/gone", server.uri());
    drop(server);

    let dir = tempdir().expect("tempdir");
    let images = dir.path().join("images");
    let fetcher = fetcher(images.clone());
    let mut c = candidate(&original);

    assert!(!fetcher.enrich(&mut c).await);
    assert_eq!(c.owner.avatar_url.as_deref(), Some(original.as_str()));
    assert!(!images.join("square").exists());
    let leftovers = std::fs::read_dir(&images)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn unsafe_owner_login_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let fetcher = fetcher(dir.path().to_path_buf());
    let err = fetcher
        .fetch_avatar("../escape", "http://127.0.0.1:9/avatar")
        .await
        .expect_err("must reject");
    assert!(err.to_string().contains("not usable"));
}
