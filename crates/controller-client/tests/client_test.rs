//! Controller client against an in-process HTTP server

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, put};
use controller_client::{ControllerClient, REQUEST_ID_HEADER};
use std::sync::{Arc, Mutex};
use storage_core::api::VolumePublicationUpdate;
use storage_core::{Node, RequestContext, RequestSource, with_request_context};

#[derive(Default)]
struct Seen {
    request_ids: Vec<String>,
    luks_names: Vec<Vec<String>>,
    delete_calls: usize,
}

type Shared = Arc<Mutex<Seen>>;

async fn put_node(State(seen): State<Shared>, headers: HeaderMap, Json(node): Json<Node>) -> (StatusCode, Json<serde_json::Value>) {
    let id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    seen.lock().expect("lock").request_ids.push(id);
    (StatusCode::CREATED, Json(serde_json::json!({ "name": node.name })))
}

async fn list_nodes() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "nodes": ["n1", "n2"] }))
}

async fn delete_node(State(seen): State<Shared>, Path(name): Path<String>) -> (StatusCode, Json<serde_json::Value>) {
    seen.lock().expect("lock").delete_calls += 1;
    let status = match name.as_str() {
        "gone" => StatusCode::NOT_FOUND,
        "going" => StatusCode::GONE,
        "odd" => StatusCode::UNPROCESSABLE_ENTITY,
        "broken" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::NO_CONTENT,
    };
    (status, Json(serde_json::json!({ "error": format!("node {name}") })))
}

async fn get_chap(Path((volume, node)): Path<(String, String)>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "chap": {
            "initiatorUser": format!("{volume}-{node}"),
            "initiatorSecret": "s3cret",
            "targetUser": "t",
            "targetSecret": "t0p"
        }
    }))
}

async fn put_luks(State(seen): State<Shared>, Json(names): Json<Vec<String>>) -> StatusCode {
    seen.lock().expect("lock").luks_names.push(names);
    StatusCode::ACCEPTED
}

async fn put_publication(Json(update): Json<VolumePublicationUpdate>) -> StatusCode {
    if update.not_safe_to_attach.is_some() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    }
}

async fn serve() -> (ControllerClient, Shared) {
    let seen = Shared::default();
    let app = Router::new()
        .route("/trident/v1/node", get(list_nodes))
        .route("/trident/v1/node/{name}", put(put_node).delete(delete_node))
        .route("/trident/v1/chap/{volume}/{node}", get(get_chap))
        .route("/trident/v1/volume/{volume}/luksPassphraseNames", put(put_luks))
        .route("/trident/v1/publication/{volume}/{node}", put(put_publication))
        .with_state(Arc::clone(&seen));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let client = ControllerClient::new("127.0.0.1", port, None).expect("client");
    (client, seen)
}

#[tokio::test]
async fn test_create_node_propagates_request_id() {
    let (client, seen) = serve().await;
    let node = Node {
        name: "n1".to_string(),
        iqn: "iqn.2000-01.x:y".to_string(),
        ..Default::default()
    };
    let ctx = RequestContext {
        request_id: "req-42".to_string(),
        source: RequestSource::Csi,
    };

    let response = with_request_context(ctx, client.create_node(&node)).await.expect("create node");
    assert_eq!(response.name, "n1");
    assert_eq!(seen.lock().expect("lock").request_ids, vec!["req-42"]);
}

#[tokio::test]
async fn test_list_nodes() {
    let (client, _) = serve().await;
    assert_eq!(client.list_nodes().await.expect("list"), vec!["n1", "n2"]);
}

#[tokio::test]
async fn test_delete_node_tolerates_gone_nodes() {
    let (client, seen) = serve().await;
    for name in ["n1", "gone", "going", "odd"] {
        client.delete_node(name).await.expect("treated as deleted");
    }
    client.delete_node("gone").await.expect("second delete also succeeds");
    assert_eq!(seen.lock().expect("lock").delete_calls, 5);

    let err = client.delete_node("broken").await.expect_err("500 surfaces");
    assert_eq!(err.status(), Some(500));
    assert!(err.to_string().contains("could not delete node"));
}

#[tokio::test]
async fn test_get_chap() {
    let (client, _) = serve().await;
    let chap = client.get_chap("vol-1", "n1").await.expect("chap");
    assert_eq!(chap.initiator_user, "vol-1-n1");
    assert_eq!(chap.target_secret, "t0p");
}

#[tokio::test]
async fn test_luks_names_are_sent_in_order() {
    let (client, seen) = serve().await;
    client
        .update_volume_luks_passphrase_names("vol-1", &["K2".to_string(), "K1".to_string()])
        .await
        .expect("update");
    assert_eq!(seen.lock().expect("lock").luks_names, vec![vec!["K2", "K1"]]);
}

#[tokio::test]
async fn test_publication_update() {
    let (client, _) = serve().await;
    client
        .update_volume_publication(
            "v",
            "n",
            &VolumePublicationUpdate {
                not_safe_to_attach: Some(true),
            },
        )
        .await
        .expect("update");
    let err = client
        .update_volume_publication("v", "n", &VolumePublicationUpdate::default())
        .await
        .expect_err("400 surfaces");
    assert_eq!(err.status(), Some(400));
}

#[tokio::test]
async fn test_transport_failure_is_a_connection_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let client = ControllerClient::new("127.0.0.1", port, None).expect("client");
    let err = client.list_nodes().await.expect_err("nothing listening");
    assert!(err.is_connection());
    assert!(err.to_string().contains("could not list nodes"));
}
