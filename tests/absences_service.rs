use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use httpmock::prelude::*;
use serde_json::json;

use absentia::cache::ReportCache;
use absentia::config::{Credentials, PortalEndpoints};
use absentia::error::PortalError;
use absentia::portal::PortalClient;
use absentia::{create_test_router, AppState};

const USERNAME: &str = "s12345";
const PASSWORD: &str = "hunter2";

fn endpoints(server: &MockServer) -> PortalEndpoints {
    PortalEndpoints {
        auth_url: server.url("/auth/realms/test/protocol/openid-connect/auth"),
        api_base: server.base_url(),
    }
}

fn credentials() -> Credentials {
    Credentials {
        username: USERNAME.to_string(),
        password: PASSWORD.to_string(),
        profile_override: None,
    }
}

fn login_page(server: &MockServer) -> String {
    format!(
        r#"<html><body>
        <form id="kc-form-login" action="{}" method="post">
            <input type="hidden" name="session_code" value="abc123"/>
            <input type="hidden" name="execution" value="exec-1"/>
            <input type="text" name="username" value=""/>
            <input type="password" name="password"/>
            <input type="submit" value="Log in"/>
        </form></body></html>"#,
        server.url("/auth/login-actions/authenticate")
    )
}

struct PortalMocks<'a> {
    auth_page: httpmock::Mock<'a>,
    login: httpmock::Mock<'a>,
    me: httpmock::Mock<'a>,
    review: httpmock::Mock<'a>,
    periods: httpmock::Mock<'a>,
    progress: httpmock::Mock<'a>,
}

fn mount_portal(server: &MockServer) -> PortalMocks<'_> {
    let auth_page = server.mock(|when, then| {
        when.method(GET)
            .path("/auth/realms/test/protocol/openid-connect/auth");
        then.status(200)
            .header("content-type", "text/html")
            .body(login_page(server));
    });

    let login = server.mock(|when, then| {
        when.method(POST)
            .path("/auth/login-actions/authenticate")
            .body_contains("session_code=abc123")
            .body_contains(format!("username={USERNAME}"))
            .body_contains(format!("password={PASSWORD}"));
        then.status(302).header(
            "location",
            "https://portal.example/callback/index.html#state=xyz&access_token=tok-1&token_type=Bearer",
        );
    });

    let me = server.mock(|when, then| {
        when.method(GET)
            .path("/api/users/me/")
            .header("authorization", "Bearer tok-1");
        then.status(200)
            .json_body(json!({"id": "u-1", "sameAs": "stu-uuid-1"}));
    });

    let review = server.mock(|when, then| {
        when.method(POST)
            .path("/athena-conductor/rest/persons/students/stu-uuid-1/academic-review")
            .header("authorization", "Bearer tok-1");
        then.status(200).json_body(json!({
            "profiles": [
                {"id": "prof-inactive", "activeProfile": false,
                 "study": {"traineeRegistrationNumber": USERNAME}},
                {"id": "prof-1", "activeProfile": true,
                 "study": {"traineeRegistrationNumber": USERNAME}}
            ]
        }));
    });

    let now = Utc::now();
    let periods = server.mock(|when, then| {
        when.method(GET)
            .path("/athena-conductor/rest/study-profiles/prof-1/periods")
            .header("authorization", "Bearer tok-1");
        then.status(200).json_body(json!([
            {
                "id": "per-old",
                "academicConvergence": {
                    "dateFrom": (now - ChronoDuration::days(300)).to_rfc3339(),
                    "dateTo": (now - ChronoDuration::days(200)).to_rfc3339()
                }
            },
            {
                "id": "per-now",
                "academicConvergence": {
                    "dateFrom": (now - ChronoDuration::days(10)).to_rfc3339(),
                    "dateTo": (now + ChronoDuration::days(80)).to_rfc3339()
                }
            }
        ]));
    });

    let progress = server.mock(|when, then| {
        when.method(GET)
            .path("/athena-conductor/rest/study-profiles/periods/per-now/progress")
            .header("authorization", "Bearer tok-1");
        then.status(200).json_body(json!({
            "modules": [
                {"name": "Calculus I", "absences": {"absences": 3}},
                {"name": null,
                 "studyPeriodModule": {"module": {"title": "Physics Lab"}},
                 "absences": {"absences": 1.5}},
                {"name": "Ethics", "absences": {"absences": 0}}
            ]
        }));
    });

    PortalMocks {
        auth_page,
        login,
        me,
        review,
        periods,
        progress,
    }
}

#[tokio::test]
async fn full_portal_flow_builds_a_report() {
    let server = MockServer::start();
    let mocks = mount_portal(&server);

    let client = PortalClient::new(endpoints(&server)).unwrap();
    let report = client.fetch_report(&credentials()).await.unwrap();

    assert_eq!(report.total_used, 4.5);
    assert_eq!(report.per_course.len(), 2);
    assert_eq!(report.per_course["Calculus I"].used, 3.0);
    assert_eq!(report.per_course["Physics Lab"].used, 1.5);
    assert!(report.last_updated.ends_with('Z'));

    mocks.auth_page.assert();
    mocks.login.assert();
    mocks.me.assert();
    mocks.review.assert();
    mocks.periods.assert();
    mocks.progress.assert();
}

#[tokio::test]
async fn profile_override_bypasses_auto_detection() {
    let server = MockServer::start();
    let mocks = mount_portal(&server);

    let client = PortalClient::new(endpoints(&server)).unwrap();
    let creds = Credentials {
        profile_override: Some("prof-1".to_string()),
        ..credentials()
    };
    let report = client.fetch_report(&creds).await.unwrap();

    assert_eq!(report.total_used, 4.5);
    mocks.review.assert_hits(0);
}

#[tokio::test]
async fn rejected_login_is_an_error() {
    let server = MockServer::start();

    server.mock(|when, then| {
        when.method(GET)
            .path("/auth/realms/test/protocol/openid-connect/auth");
        then.status(200)
            .header("content-type", "text/html")
            .body(login_page(&server));
    });
    // Re-rendered login form instead of the 302: wrong credentials.
    server.mock(|when, then| {
        when.method(POST).path("/auth/login-actions/authenticate");
        then.status(200)
            .header("content-type", "text/html")
            .body(login_page(&server));
    });

    let client = PortalClient::new(endpoints(&server)).unwrap();
    let err = client.fetch_report(&credentials()).await.unwrap_err();

    assert!(matches!(err, PortalError::LoginRejected { status: 200 }));
}

#[tokio::test]
async fn login_page_without_a_form_is_an_error() {
    let server = MockServer::start();

    server.mock(|when, then| {
        when.method(GET)
            .path("/auth/realms/test/protocol/openid-connect/auth");
        then.status(200)
            .header("content-type", "text/html")
            .body("<html><body>scheduled maintenance</body></html>");
    });

    let client = PortalClient::new(endpoints(&server)).unwrap();
    let err = client.fetch_report(&credentials()).await.unwrap_err();

    assert!(matches!(err, PortalError::LoginFormMissing { .. }));
}

#[tokio::test]
async fn absences_endpoint_serves_cached_json() {
    let server = MockServer::start();
    let mocks = mount_portal(&server);

    let state = AppState {
        portal: Arc::new(PortalClient::new(endpoints(&server)).unwrap()),
        credentials: Arc::new(credentials()),
        cache: Arc::new(ReportCache::new(
            Duration::from_secs(1800),
            Duration::from_secs(300),
        )),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_test_router(state)).await.unwrap();
    });

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/absences"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["total_used"], 4.5);
    assert_eq!(body["per_course"]["Calculus I"]["used"], 3.0);
    assert_eq!(body["per_course"]["Physics Lab"]["used"], 1.5);
    assert!(body["last_updated"].as_str().unwrap().ends_with('Z'));

    // The second request is served from the cache: one portal login total.
    let again: serde_json::Value = reqwest::get(format!("http://{addr}/absences"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["total_used"], 4.5);

    mocks.auth_page.assert();
    mocks.login.assert();
}

#[tokio::test]
async fn absences_endpoint_reports_backoff_without_data() {
    let server = MockServer::start();

    // Portal is down: the auth page 500s.
    server.mock(|when, then| {
        when.method(GET)
            .path("/auth/realms/test/protocol/openid-connect/auth");
        then.status(500);
    });

    let state = AppState {
        portal: Arc::new(PortalClient::new(endpoints(&server)).unwrap()),
        credentials: Arc::new(credentials()),
        cache: Arc::new(ReportCache::new(
            Duration::from_secs(1800),
            Duration::from_secs(300),
        )),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_test_router(state)).await.unwrap();
    });

    let first = reqwest::get(format!("http://{addr}/absences")).await.unwrap();
    assert_eq!(first.status(), 503);
    let body: serde_json::Value = first.json().await.unwrap();
    assert_eq!(body["error"], "no data yet");

    let second = reqwest::get(format!("http://{addr}/absences")).await.unwrap();
    assert_eq!(second.status(), 503);
    let body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(body["error"], "temporary backoff");
}
