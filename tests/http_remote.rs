//! HTTP remote contract tests
//!
//! Verify the REST calls `HttpRemote` makes and how responses map onto
//! `SyncError`, against a wiremock server.

use serde_json::json;
use std::time::Duration;
use todo_sync::{HttpRemote, Item, NewItem, RemoteClient, SyncError};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn todo_json(id: &str, title: &str) -> serde_json::Value {
    json!({
        "id": id,
        "title": title,
        "completed": false,
        "createdAt": "2024-05-01T10:00:00Z",
        "updatedAt": "2024-05-01T10:00:00Z"
    })
}

fn remote(server: &MockServer) -> HttpRemote {
    HttpRemote::new(server.uri(), Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_list_parses_items() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([todo_json("1", "a"), todo_json("2", "b")])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let items = remote(&server).list().await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[1].title, "b");
}

#[tokio::test]
async fn test_create_posts_title_only() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/todos"))
        .and(body_partial_json(json!({"title": "Buy milk", "completed": false})))
        .respond_with(ResponseTemplate::new(201).set_body_json(todo_json("S1", "Buy milk")))
        .expect(1)
        .mount(&server)
        .await;

    let created = remote(&server)
        .create(&NewItem {
            title: "Buy milk".into(),
            completed: false,
        })
        .await
        .unwrap();
    assert_eq!(created.id, "S1");
}

#[tokio::test]
async fn test_update_puts_full_item() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/todos/S1"))
        .and(body_partial_json(json!({"id": "S1", "completed": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(todo_json("S1", "Buy milk")))
        .expect(1)
        .mount(&server)
        .await;

    let item: Item = serde_json::from_value(todo_json("S1", "Buy milk")).unwrap();
    let toggled = item.toggled();
    remote(&server).update(&toggled).await.unwrap();
}

#[tokio::test]
async fn test_not_found_maps_to_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/todos/404"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = remote(&server).delete("404").await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
    assert!(err.is_permanent());
}

#[tokio::test]
async fn test_delete_accepts_no_content() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/todos/7"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    remote(&server).delete("7").await.unwrap();
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = remote(&server).list().await.unwrap_err();
    match &err {
        SyncError::RequestFailed { status, message } => {
            assert_eq!(*status, Some(503));
            assert_eq!(message, "maintenance");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_transient());
    assert!(!err.is_permanent());
}

#[tokio::test]
async fn test_timeout_is_request_failed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/todos"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let remote = HttpRemote::new(server.uri(), Duration::from_millis(50)).unwrap();
    let err = remote.list().await.unwrap_err();
    assert!(matches!(err, SyncError::RequestFailed { status: None, .. }));
}

#[tokio::test]
async fn test_unreachable_server_is_network_unavailable() {
    // bind then drop to get a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let remote = HttpRemote::new(format!("http://{}", addr), Duration::from_secs(2)).unwrap();
    let err = remote.list().await.unwrap_err();
    assert!(err.is_offline(), "got {err:?}");
}

#[tokio::test]
async fn test_categories_send_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/categories/minimal"))
        .and(header("authorization", "Bearer simple-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"_id": "c1", "name": "Work"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let remote = remote(&server).with_auth_token(Some("simple-token".into()));
    let categories = remote.list_categories().await.unwrap();
    assert_eq!(categories[0].id, "c1");
    assert_eq!(categories[0].name, "Work");
}
