use axum::{http::StatusCode, routing::post, Json, Router};
use scoring::{HttpScoringClient, ScoringClient, ScoringError};
use serde_json::{json, Value};

async fn score(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    match body["audio_url"].as_str().unwrap_or_default() {
        "https://cdn.example/broken.wav" => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({})))
        }
        "https://cdn.example/silent.wav" => (
            StatusCode::OK,
            Json(json!({ "score": 0.0, "error": "no vocals detected" })),
        ),
        _ if body["song_id"] == "song-1" => (StatusCode::OK, Json(json!({ "score": 87.5 }))),
        _ => (StatusCode::OK, Json(json!({ "score": 12.0 }))),
    }
}

async fn spawn_scoring_service() -> String {
    let app = Router::new().route("/score", post(score));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn posts_audio_and_song_to_score_endpoint() {
    let base_url = spawn_scoring_service().await;
    let client = HttpScoringClient::new(&base_url).expect("client");

    let score = client
        .score_audio("https://cdn.example/take1.wav", "song-1")
        .await
        .expect("score");
    assert_eq!(score, 87.5);
}

#[tokio::test]
async fn non_ok_status_is_an_error() {
    let base_url = spawn_scoring_service().await;
    let client = HttpScoringClient::new(&base_url).expect("client");

    let err = client
        .score_audio("https://cdn.example/broken.wav", "song-1")
        .await
        .expect_err("status error");
    assert!(matches!(err, ScoringError::Status(500)));
}

#[tokio::test]
async fn remote_error_field_is_an_error() {
    let base_url = spawn_scoring_service().await;
    let client = HttpScoringClient::new(&base_url).expect("client");

    let err = client
        .score_audio("https://cdn.example/silent.wav", "song-1")
        .await
        .expect_err("remote error");
    assert!(matches!(err, ScoringError::Remote(ref message) if message == "no vocals detected"));
}

#[tokio::test]
async fn empty_audio_url_is_rejected_before_any_request() {
    let client = HttpScoringClient::new("http://127.0.0.1:9").expect("client");
    let err = client.score_audio("  ", "song-1").await.expect_err("empty");
    assert!(matches!(err, ScoringError::EmptyAudioUrl));
}
