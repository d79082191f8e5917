use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use loris::{AppConfig, AppContext, build_router, lab, schema::AdapterRegistry};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

async fn app(dir: &TempDir) -> axum::Router {
    let config = AppConfig {
        tmp_folder: dir.path().join("tmp"),
        settings_folder: dir.path().join("settings"),
        group_table: Some("experimenters.Membership".to_string()),
        config_forms: BTreeMap::from([(
            "recordings.Recording".to_string(),
            BTreeMap::from([("analysis".to_string(), json!({"window": "int", "channels": "list"}))]),
        )]),
        ..AppConfig::default()
    };
    let db = lab::demo_database(&AdapterRegistry::default()).unwrap();
    let ctx = AppContext::new(config, db).await.unwrap();
    ctx.auth()
        .create_user("bob", "bobpassword", loris::auth::Role::Experimenter)
        .await
        .unwrap();
    build_router(Arc::new(ctx))
}

async fn send(app: &axum::Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header("authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(payload) => request
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string())),
        None => request.body(Body::empty()),
    }
    .expect("request should build");

    let response = app.clone().oneshot(request).await.expect("response expected");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");

    if body.is_empty() {
        return (status, Value::Null);
    }
    let json = serde_json::from_slice::<Value>(&body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
    (status, json)
}

async fn login(app: &axum::Router, username: &str, password: &str) -> String {
    let (status, body) = send(
        app,
        Method::POST,
        "/api/login",
        None,
        Some(json!({"username": username, "password": password})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    body["data"]["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_requests_need_a_session() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;

    let (status, body) = send(&app, Method::GET, "/api/tables", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], json!("unauthorized"));

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/login",
        None,
        Some(json!({"username": "admin", "password": "wrong"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_form_insert_and_list() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let token = login(&app, "admin", "adminpass").await;

    let (status, body) = send(&app, Method::GET, "/api/tables", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 14);

    let (status, body) = send(&app, Method::GET, "/api/tables/subjects.Subject/form", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let fields = body["data"]["form"]["fields"].as_array().unwrap();
    assert!(fields.iter().any(|field| field["meta"]["name"] == json!("experimenter")));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/tables/subjects.Subject/rows",
        Some(&token),
        Some(json!({"species": "zebrafish", "experimenter": "alice", "sex": "M"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["data"]["_id"], json!({"subject_id": 1}));

    let (status, body) = send(&app, Method::GET, "/api/tables/subjects.Subject/rows", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let rows = body["data"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["experimenter"], json!("alice"));
    assert_eq!(rows[0]["_id"], json!({"subject_id": 1}));
}

#[tokio::test]
async fn test_invalid_submission_returns_field_errors() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let token = login(&app, "admin", "adminpass").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/tables/subjects.Subject/rows",
        Some(&token),
        Some(json!({"species": "zebrafish", "experimenter": "nobody", "sex": "M"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], json!("validation_error"));
    assert!(body["fields"]["experimenter"].is_array());
}

#[tokio::test]
async fn test_edit_and_delete_check_ownership() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let admin = login(&app, "admin", "adminpass").await;
    let bob = login(&app, "bob", "bobpassword").await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/tables/subjects.Subject/rows",
        Some(&admin),
        Some(json!({"species": "zebrafish", "experimenter": "alice", "sex": "F"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let edit = json!({
        "_id": {"subject_id": 1},
        "values": {"species": "zebrafish", "experimenter": "alice", "sex": "M", "subject_name": "renamed"}
    });
    let (status, body) = send(&app, Method::PUT, "/api/tables/subjects.Subject/rows", Some(&bob), Some(edit.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], json!("forbidden"));

    let (status, _) = send(&app, Method::PUT, "/api/tables/subjects.Subject/rows", Some(&admin), Some(edit)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/tables/subjects.Subject/rows/load",
        Some(&admin),
        Some(json!({"_id": {"subject_id": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["subject_name"], json!("renamed"));
    assert_eq!(body["data"]["sex"], json!("M"));

    let (status, _) = send(
        &app,
        Method::DELETE,
        "/api/tables/subjects.Subject/rows",
        Some(&bob),
        Some(json!({"_id": {"subject_id": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        Method::DELETE,
        "/api/tables/subjects.Subject/rows",
        Some(&admin),
        Some(json!({"_id": {"subject_id": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["subjects.Subject"], json!(1));

    let (status, _) = send(
        &app,
        Method::DELETE,
        "/api/tables/subjects.Subject/rows",
        Some(&admin),
        Some(json!({"_id": {"subject_id": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_settings_bundle_lifecycle() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let token = login(&app, "admin", "adminpass").await;

    let (status, body) = send(&app, Method::GET, "/api/tables/recordings.Recording/form", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["settings_forms"]["analysis"]["fields"].is_array());

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/tables/recordings.Recording/settings",
        Some(&token),
        Some(json!({
            "name": "default analysis",
            "experiment_form": {"system_name": "", "completed": "0"},
            "forms": {"analysis": {"window": "5", "channels": "[1, 2]"}}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let id = body["data"]["_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, Method::GET, "/api/tables/recordings.Recording/settings", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let uri = format!("/api/tables/recordings.Recording/settings/{}/values", id);
    let (status, body) = send(&app, Method::GET, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["analysis"], json!({"window": 5, "channels": [1, 2]}));

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/tables/recordings.Recording/settings",
        Some(&token),
        Some(json!({"name": "broken", "forms": {"analysis": {"window": "five", "channels": "[1]"}}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["fields"]["analysis.window"].is_array());

    let uri = format!("/api/tables/recordings.Recording/settings/{}", id);
    let (status, _) = send(&app, Method::DELETE, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, Method::GET, &uri, Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_diagram_and_upload() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let token = login(&app, "admin", "adminpass").await;

    let (status, body) = send(&app, Method::GET, "/api/tables/recordings.Recording/diagram", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().unwrap().contains("\"subjects.Subject\" -> \"recordings.Recording\";"));

    let request = Request::builder()
        .method(Method::PUT)
        .uri("/api/uploads/trace.json")
        .header("authorization", format!("Bearer {}", token))
        .body(Body::from("[1, 2, 3]"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    let path = body["data"]["message"].as_str().unwrap();
    assert!(path.ends_with("trace.json"));
    assert!(std::path::Path::new(path).exists());
}

#[tokio::test]
async fn test_account_management() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let admin = login(&app, "admin", "adminpass").await;
    let bob = login(&app, "bob", "bobpassword").await;

    let (status, body) = send(&app, Method::GET, "/api/users", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    let users = body["data"].as_array().unwrap();
    assert!(users.contains(&json!("admin")) && users.contains(&json!("bob")));
    let (status, _) = send(&app, Method::GET, "/api/users", Some(&bob), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/password",
        Some(&bob),
        Some(json!({"old_password": "wrong", "new_password": "bobsecret"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/password",
        Some(&bob),
        Some(json!({"old_password": "bobpassword", "new_password": "bobsecret"})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/login",
        None,
        Some(json!({"username": "bob", "password": "bobpassword"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    login(&app, "bob", "bobsecret").await;

    let (status, body) = send(&app, Method::DELETE, "/api/users/admin", Some(&admin), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], json!("conflict"));
    let (status, _) = send(&app, Method::DELETE, "/api/users/bob", Some(&admin), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::DELETE, "/api/users/bob", Some(&admin), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_group_registration() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let admin = login(&app, "admin", "adminpass").await;
    let bob = login(&app, "bob", "bobpassword").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/groups",
        Some(&bob),
        Some(json!({"group_name": "imaging", "experimenter": "bob"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["data"]["_id"], json!({"group_name": "imaging", "experimenter": "bob"}));

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/groups",
        Some(&admin),
        Some(json!({"group_name": "ephys", "experimenter": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/groups",
        Some(&bob),
        Some(json!({"group_name": "ephys", "experimenter": "bob"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/groups",
        Some(&bob),
        Some(json!({"group_name": "imaging", "experimenter": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, Method::GET, "/api/groups", Some(&bob), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_declare_then_join() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir).await;
    let admin = login(&app, "admin", "adminpass").await;
    let bob = login(&app, "bob", "bobpassword").await;

    let declaration = json!({
        "name": "subjects.Note",
        "tier": "manual",
        "definition": "note_id : int\n---\n-> Subject\nnote : varchar(255)"
    });
    let (status, _) = send(&app, Method::POST, "/api/declare", Some(&bob), Some(declaration.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, body) = send(&app, Method::POST, "/api/declare", Some(&admin), Some(declaration)).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");

    let (status, body) = send(&app, Method::GET, "/api/tables", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 15);

    let (status, body) = send(&app, Method::GET, "/api/tables/subjects.Note/form", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    for (experimenter, sex) in [("alice", "F"), ("bob", "M")] {
        let (status, _) = send(
            &app,
            Method::POST,
            "/api/tables/subjects.Subject/rows",
            Some(&admin),
            Some(json!({"species": "zebrafish", "experimenter": experimenter, "sex": sex})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/join",
        Some(&bob),
        Some(json!({
            "tables": ["subjects.Subject", "experimenters.Experimenter"],
            "restriction": {"sex": "M"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let rows = body["data"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["experimenter"], json!("bob"));
    assert_eq!(rows[0]["first_name"], json!("Bob"));

    let (status, _) = send(&app, Method::POST, "/api/join", Some(&bob), Some(json!({"tables": []}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(&app, Method::POST, "/api/refresh", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app, Method::GET, "/api/tables", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 15);
}
