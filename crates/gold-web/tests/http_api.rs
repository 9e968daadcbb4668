use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use gold_core::{Commit, Expectations, Label, Params, Tile, Trace};
use gold_store::{
    ExpectationsStore, MemExpectationsStore, NoIgnores, SqliteExpectationsStore,
    StaticIgnoreStore, StaticTileProvider,
};
use gold_web::{AppState, ByBlameCache, USER_HEADER, router};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::tempdir;
use tower::ServiceExt;

fn trace(test: &str, device: &str, values: &[Option<&str>]) -> Trace {
    let params: Params = [
        ("name".to_owned(), test.to_owned()),
        ("device".to_owned(), device.to_owned()),
        ("source_type".to_owned(), "gm".to_owned()),
    ]
    .into_iter()
    .collect();
    Trace::new(params, values.iter().map(|v| v.map(str::to_owned)).collect())
}

fn tile() -> Tile {
    let commits = ["aaa", "bbb", "ccc"]
        .iter()
        .enumerate()
        .map(|(index, hash)| Commit {
            hash: (*hash).to_owned(),
            index,
            timestamp: 1_000 + index as i64,
            author: format!("dev{index}@example.com"),
            subject: format!("commit {index}"),
        })
        .collect();
    Tile::new(
        commits,
        vec![
            trace("circle", "x86", &[Some("c0"), Some("c1"), Some("c1")]),
            trace("square", "x86", &[Some("s0"), Some("s0"), Some("s1")]),
        ],
    )
    .expect("tile")
}

fn seeded_expectations() -> Expectations {
    let mut exp = Expectations::new();
    exp.set("circle", "c0", Label::Positive);
    exp.set("square", "s0", Label::Positive);
    exp
}

fn cache() -> ByBlameCache {
    ByBlameCache::new(8, Duration::from_secs(60), Duration::from_secs(5))
}

fn app_with_store(store: Arc<dyn ExpectationsStore>) -> Router {
    router(AppState::new(
        Arc::new(StaticTileProvider::new(tile())),
        store,
        Arc::new(NoIgnores),
        cache(),
    ))
}

fn app() -> Router {
    app_with_store(Arc::new(MemExpectationsStore::with_primary(seeded_expectations())))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).expect("request")
}

fn triage_request(body: Value, user: Option<&str>) -> Request<Body> {
    let mut builder = Request::post("/json/v2/triage").header("content-type", "application/json");
    if let Some(user) = user {
        builder = builder.header(USER_HEADER, user);
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (status, body) = send(&app(), get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".to_owned()));
}

#[tokio::test]
async fn by_blame_groups_untriaged_digests() {
    let app = app();
    let (status, body) = send(&app, get("/json/v2/byblame?query=source_type%3Dgm")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stale"], false);

    let data = body["data"].as_array().expect("data array");
    let groups: Vec<_> = data.iter().map(|entry| entry["groupID"].clone()).collect();
    assert_eq!(groups, vec![json!("bbb"), json!("ccc")]);
    assert_eq!(data[0]["affectedTests"][0]["test"], "circle");
    assert_eq!(data[0]["commits"][0]["author"], "dev1@example.com");
}

#[tokio::test]
async fn by_blame_requires_a_corpus() {
    let (status, body) = send(&app(), get("/json/v2/byblame")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().expect("error").contains("source_type"));
}

#[tokio::test]
async fn by_blame_skips_ignored_traces() {
    let ignored = trace("circle", "x86", &[]).id();
    let app = router(AppState::new(
        Arc::new(StaticTileProvider::new(tile())),
        Arc::new(MemExpectationsStore::with_primary(seeded_expectations())),
        Arc::new(StaticIgnoreStore::new([ignored])),
        cache(),
    ));

    let (_, body) = send(&app, get("/json/v2/byblame?corpus=gm")).await;
    let data = body["data"].as_array().expect("data array");
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["groupID"], "ccc");
}

#[tokio::test]
async fn triage_without_user_is_unauthorized() {
    let body = json!({"testDigestStatus": {"circle": {"c1": "positive"}}});
    let (status, _) = send(&app(), triage_request(body, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn triage_with_unknown_label_is_rejected() {
    let body = json!({"testDigestStatus": {"circle": {"c1": "maybe"}}});
    let (status, body) = send(&app(), triage_request(body, Some("dev@example.com"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().expect("error").contains("maybe"));
}

#[tokio::test]
async fn triage_refreshes_blame_and_lands_in_log() {
    let app = app();
    let (_, before) = send(&app, get("/json/v2/byblame?corpus=gm")).await;
    assert_eq!(before["data"].as_array().expect("data").len(), 2);

    let body = json!({
        "testDigestStatus": {
            "circle": {"c1": "positive"},
            "square": {"s1": "negative", "s0": ""}
        },
        "issue": "0"
    });
    let (status, triaged) = send(&app, triage_request(body, Some("dev@example.com"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(triaged["changeCount"], 2);

    let (_, after) = send(&app, get("/json/v2/byblame?corpus=gm")).await;
    assert_eq!(after["data"], json!([]));

    let (status, log) = send(&app, get("/json/v2/triagelog?details=true")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(log["total"], 1);
    assert_eq!(log["size"], 20);
    let entry = &log["entries"][0];
    assert_eq!(entry["id"], triaged["id"]);
    assert_eq!(entry["name"], "dev@example.com");
    assert_eq!(entry["details"].as_array().expect("details").len(), 2);
}

#[tokio::test]
async fn changelist_triage_is_logged_separately() {
    let app = app();
    let body = json!({
        "testDigestStatus": {"circle": {"c1": "positive"}},
        "issue": 42,
        "crs": "gerrit"
    });
    let (status, _) = send(&app, triage_request(body, Some("dev@example.com"))).await;
    assert_eq!(status, StatusCode::OK);

    let (_, primary) = send(&app, get("/json/v2/triagelog")).await;
    assert_eq!(primary["total"], 0);
    let (_, changelist) = send(&app, get("/json/v2/triagelog?issue=42&crs=gerrit&size=999")).await;
    assert_eq!(changelist["total"], 1);
    assert_eq!(changelist["size"], 200);
    assert_eq!(changelist["entries"][0]["details"], json!([]));

    let (_, blame) = send(&app, get("/json/v2/byblame?corpus=gm")).await;
    assert_eq!(blame["data"].as_array().expect("data").len(), 2);
}

#[tokio::test]
async fn undo_reverts_a_sqlite_backed_triage() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let store = SqliteExpectationsStore::open(dir.path().join("expectations.sqlite"))?;
    let app = app_with_store(Arc::new(store));

    let body = json!({"testDigestStatus": {"circle": {"c0": "positive", "c1": "negative"}}});
    let (_, triaged) = send(&app, triage_request(body, Some("dev@example.com"))).await;
    let id = triaged["id"].as_str().expect("record id").to_owned();

    let undo = Request::post(format!("/json/v2/triagelog/undo?id={id}"))
        .header(USER_HEADER, "reviewer@example.com")
        .body(Body::empty())?;
    let (status, entry) = send(&app, undo).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entry["name"], "reviewer@example.com");
    assert_eq!(entry["changeCount"], 2);
    let mut labels: Vec<_> = entry["details"]
        .as_array()
        .expect("details")
        .iter()
        .map(|detail| detail["label"].as_str().unwrap_or_default().to_owned())
        .collect();
    labels.sort();
    assert_eq!(labels, vec!["untriaged", "untriaged"]);

    let (_, log) = send(&app, get("/json/v2/triagelog")).await;
    assert_eq!(log["total"], 2);
    Ok(())
}

#[tokio::test]
async fn undo_of_unknown_record_is_not_found() {
    let request = Request::post("/json/v2/triagelog/undo?id=999")
        .header(USER_HEADER, "dev@example.com")
        .body(Body::empty())
        .expect("request");
    let (status, body) = send(&app(), request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}
