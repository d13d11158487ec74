use multistream_sync::backend::{RemoteStore, RestBackend};
use multistream_sync::config::BackendConfig;
use multistream_sync::models::{Platform, StreamEntity};
use multistream_sync::sync::AuthSession;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend(server: &MockServer) -> RestBackend<StreamEntity> {
    let config = BackendConfig {
        rest_url: format!("{}/rest/v1", server.uri()),
        realtime_url: "ws://127.0.0.1:1/realtime/v1/websocket".to_string(),
        api_key: "anon-key".to_string(),
        health_url: server.uri(),
        request_timeout_secs: 5,
        probe_interval_secs: 15,
    };
    RestBackend::new(config).unwrap()
}

fn row(id: &str, channel: &str, updated_at: i64) -> serde_json::Value {
    json!({
        "id": id,
        "ownerId": "u1",
        "updatedAt": updated_at,
        "platform": "twitch",
        "channel": channel,
        "title": "live now",
        "viewerCount": 42,
        "isLive": true
    })
}

// ── Reads ───────────────────────────────────────────────────────

#[tokio::test]
async fn fetch_one_filters_by_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/streams"))
        .and(query_param("id", "eq.s1"))
        .and(query_param("select", "*"))
        .and(header("apikey", "anon-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row("s1", "foo", 10)])))
        .expect(1)
        .mount(&server)
        .await;

    let stream = backend(&server).fetch_one("s1").await.unwrap().unwrap();
    assert_eq!(stream.channel, "foo");
    assert_eq!(stream.viewer_count, 42);
    assert!(stream.is_live);
    // Fields the backend omitted fall back to their defaults.
    assert_eq!(stream.volume, 1.0);
}

#[tokio::test]
async fn fetch_one_of_missing_row_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/streams"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    assert!(backend(&server).fetch_one("missing").await.unwrap().is_none());
}

// ── Writes ──────────────────────────────────────────────────────

#[tokio::test]
async fn create_is_an_upsert_sent_with_the_session_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/streams"))
        .and(header_exists("Prefer"))
        .and(header("authorization", "Bearer user-token"))
        .and(body_partial_json(json!({"channel": "foo", "platform": "twitch"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([row("s1", "foo", 11)])))
        .expect(1)
        .mount(&server)
        .await;

    let client = backend(&server);
    client.authorize(Some(&AuthSession::new("u1", "user-token")));

    let mut stream = StreamEntity::new("u1", Platform::Twitch, "foo");
    stream.id = "s1".to_string();
    let created = client.create(&stream).await.unwrap();
    assert_eq!(created.updated_at, 11);

    let requests = server.received_requests().await.unwrap();
    let prefer = requests[0].headers.get("prefer").unwrap().to_str().unwrap();
    assert!(prefer.contains("return=representation"));
    assert!(prefer.contains("resolution=merge-duplicates"));
}

#[tokio::test]
async fn create_without_representation_returns_the_sent_entity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/streams"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let stream = StreamEntity::new("u1", Platform::Kick, "bar");
    let created = backend(&server).create(&stream).await.unwrap();
    assert_eq!(created, stream);
}

#[tokio::test]
async fn anonymous_requests_carry_the_api_key_as_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer anon-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let client = backend(&server);
    client.authorize(Some(&AuthSession::new("u1", "user-token")));
    client.authorize(None);
    client.fetch_one("s1").await.unwrap();
}

#[tokio::test]
async fn update_patches_the_filtered_row() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/streams"))
        .and(query_param("id", "eq.s1"))
        .and(body_partial_json(json!({"muted": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row("s1", "foo", 20)])))
        .expect(1)
        .mount(&server)
        .await;

    let updated = backend(&server)
        .update("s1", &json!({"muted": true, "updatedAt": 20}))
        .await
        .unwrap();
    assert_eq!(updated.updated_at, 20);
}

#[tokio::test]
async fn update_matching_no_rows_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let err = backend(&server)
        .update("gone", &json!({"muted": true}))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn delete_reports_missing_rows() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(query_param("id", "eq.s1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row("s1", "foo", 10)])))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(query_param("id", "eq.s2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let client = backend(&server);
    client.delete("s1").await.unwrap();
    assert!(client.delete("s2").await.unwrap_err().is_not_found());
}

// ── Failure taxonomy ────────────────────────────────────────────

#[tokio::test]
async fn http_statuses_map_onto_retry_classes() {
    let server = MockServer::start().await;
    for (id, status) in [("a", 401), ("b", 503), ("c", 400), ("d", 429)] {
        Mock::given(method("GET"))
            .and(query_param("id", format!("eq.{}", id)))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;
    }

    let client = backend(&server);

    let unauthorized = client.fetch_one("a").await.unwrap_err();
    assert!(unauthorized.is_unauthorized());
    assert!(!unauthorized.is_retryable());

    assert!(client.fetch_one("b").await.unwrap_err().is_retryable());

    let rejected = client.fetch_one("c").await.unwrap_err();
    assert!(!rejected.is_retryable());
    assert!(!rejected.is_unauthorized());

    assert!(client.fetch_one("d").await.unwrap_err().is_retryable());
}
