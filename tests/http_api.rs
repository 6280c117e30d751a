#![cfg(not(tarpaulin_include))]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use serde_json::Value;
use surveytray::app::{AppState, router};
use surveytray::{Config, db};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    _uploads: TempDir,
}

async fn test_app() -> TestApp {
    let uploads = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.upload_dir = uploads.path().to_path_buf();

    let pool = db::connect_in_memory().await.unwrap();
    db::seed_demo_users(&pool).await.unwrap();
    TestApp {
        router: router(AppState::new(pool, config)),
        _uploads: uploads,
    }
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Log in and return the `session=<id>` cookie pair.
    async fn login(&self, username: &str, password: &str) -> String {
        let response = self
            .send(form("/login", None, &format!("username={}&password={}", username, password)))
            .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .expect("session cookie")
            .to_str()
            .unwrap();
        assert!(set_cookie.contains("HttpOnly"));
        set_cookie.split(';').next().unwrap().to_string()
    }
}

fn get(uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::get(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

fn form(uri: &str, cookie: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn multipart(uri: &str, cookie: &str, fields: &[(&str, &str)]) -> Request<Body> {
    let boundary = "surveytray-test-boundary";
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
            boundary, name, value
        ));
    }
    body.push_str(&format!("--{}--\r\n", boundary));
    Request::post(uri)
        .header(header::COOKIE, cookie)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

async fn json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

const OUTLET: &str = "urn=LAG-001&outlet_name=Mama+Put&address=12+Allen+Ave&phone=0801&outlet_type=Shop&local_govt=Ikeja&state=LAGOS&region=SW";

#[tokio::test]
async fn health_reports_database_counts() {
    let app = test_app().await;
    let response = app.send(get("/health", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::X_CONTENT_TYPE_OPTIONS).unwrap(),
        "nosniff"
    );
    let body = json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"]["users"], 2);
}

#[tokio::test]
async fn api_requires_a_session() {
    let app = test_app().await;

    let response = app.send(get("/outlets", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json(response).await["error"], "Not authenticated");

    let browser = Request::get("/outlets")
        .header(header::ACCEPT, "text/html,application/xhtml+xml")
        .body(Body::empty())
        .unwrap();
    let response = app.send(browser).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "/login?next=%2Foutlets"
    );
}

#[tokio::test]
async fn login_rejects_bad_credentials() {
    let app = test_app().await;

    let response = app.send(form("/login", None, "username=admin&password=nope")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.send(form("/login", None, "username=admin&password=")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn json_login_and_logout() {
    let app = test_app().await;
    let request = Request::post("/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"username":"field_agent_demo","password":"agent123"}"#))
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let me = json(app.send(get("/api/me", Some(&cookie))).await).await;
    assert_eq!(me["username"], "field_agent_demo");
    assert_eq!(me["role"], "field_agent");

    let response = app.send(get("/logout", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let response = app.send(get("/api/me", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_routes_reject_field_agents() {
    let app = test_app().await;
    let agent = app.login("field_agent_demo", "agent123").await;
    let admin = app.login("admin", "admin123").await;

    let response = app.send(get("/admin", Some(&agent))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.send(get("/admin", Some(&admin))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["user_count"], 2);
}

#[tokio::test]
async fn duplicate_urn_is_a_conflict() {
    let app = test_app().await;
    let admin = app.login("admin", "admin123").await;

    let response = app.send(form("/admin/outlets/new", Some(&admin), OUTLET)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["id"].as_i64().is_some());

    let response = app.send(form("/admin/outlets/new", Some(&admin), OUTLET)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn admin_cannot_delete_themselves() {
    let app = test_app().await;
    let admin = app.login("admin", "admin123").await;
    let me = json(app.send(get("/api/me", Some(&admin))).await).await;
    let id = me["user_id"].as_i64().unwrap();

    let response = app
        .send(form(&format!("/admin/users/delete/{}", id), Some(&admin), ""))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn bulk_preview_without_criteria_is_empty() {
    let app = test_app().await;
    let admin = app.login("admin", "admin123").await;

    let body = json(app.send(get("/admin/users/preview", Some(&admin))).await).await;
    assert_eq!(body["users"], serde_json::json!([]));

    let body = json(
        app.send(get("/admin/users/preview?delete_by=region&value=SW", Some(&admin)))
            .await,
    )
    .await;
    assert_eq!(body["users"][0]["username"], "field_agent_demo");
}

#[tokio::test]
async fn export_validates_type_and_data() {
    let app = test_app().await;
    let admin = app.login("admin", "admin123").await;

    let response = app
        .send(get("/api/posm_deployments/export?type=docx", Some(&admin)))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await["error"], "Invalid export type");

    let response = app
        .send(get("/api/posm_deployments/export?type=csv", Some(&admin)))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        json(response).await["error"],
        "No data found for the selected filters"
    );
}

#[tokio::test]
async fn completed_visit_shows_up_in_the_export() {
    let app = test_app().await;
    let admin = app.login("admin", "admin123").await;
    let agent = app.login("field_agent_demo", "agent123").await;

    let created = json(app.send(form("/admin/outlets/new", Some(&admin), OUTLET)).await).await;
    let outlet_id = created["id"].as_i64().unwrap();

    let pending = json(app.send(get("/outlets", Some(&agent))).await).await;
    assert_eq!(pending["pagination"]["total_count"], 1);

    let response = app
        .send(get(&format!("/assign_execution/{}", outlet_id), Some(&agent)))
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    let response = app
        .send(multipart(
            &format!("/execution/new/{}", outlet_id),
            &agent,
            &[
                ("product_Table", "Yes"),
                ("product_Hawker_Jacket", "on"),
                ("latitude", "6.6018"),
                ("longitude", "3.3515"),
                ("notes", "Shelf restocked"),
            ],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let execution_id = json(response).await["id"].as_i64().unwrap();

    let detail = json(
        app.send(get(&format!("/execution/{}", execution_id), Some(&agent)))
            .await,
    )
    .await;
    assert_eq!(detail["status"], "Completed");

    let pending = json(app.send(get("/outlets", Some(&agent))).await).await;
    assert_eq!(pending["pagination"]["total_count"], 0);

    let response = app
        .send(get("/api/posm_deployments/export?type=csv", Some(&admin)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
        "attachment; filename=\"posm_deployments.csv\""
    );
    let csv = String::from_utf8(body_bytes(response).await).unwrap();
    let mut lines = csv.lines();
    assert!(lines.next().unwrap().starts_with("Agent Name,URN,Retail Point Name"));
    let row = lines.next().unwrap();
    assert!(row.starts_with("Demo Field Agent,LAG-001,Mama Put"));
    assert!(row.contains("Yes"));
}

#[tokio::test]
async fn report_upload_needs_a_supervisor_or_admin() {
    let app = test_app().await;
    let agent = app.login("field_agent_demo", "agent123").await;

    let request = Request::post("/reports/bulk_execution_upload")
        .header(header::COOKIE, &agent)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"executions": []}"#))
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
