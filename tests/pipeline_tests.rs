use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use lumenx::{ClientConfig, ClientError, CredentialMode, LoginRequest, LumenClient};
use secrecy::ExposeSecret;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn make_token(sub: &str, expires_in_secs: i64) -> String {
    let exp = (Utc::now() + Duration::seconds(expires_in_secs)).timestamp();
    let claims = json!({
        "sub": sub,
        "role": "patient",
        "exp": exp,
        "iat": exp - 3600,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"server-signing-key"),
    )
    .unwrap()
}

fn client_for(server: &MockServer) -> LumenClient {
    let config = ClientConfig::new(server.uri(), "test-storage-key")
        .credential_mode(CredentialMode::Local);
    LumenClient::new(config).unwrap()
}

fn client_with_csrf(server: &MockServer, token: &str) -> LumenClient {
    let config = ClientConfig::new(server.uri(), "test-storage-key")
        .credential_mode(CredentialMode::Local)
        .embedded_csrf_token(token);
    LumenClient::new(config).unwrap()
}

async fn seed_session(client: &LumenClient, access: &str, renewal: Option<&str>) {
    client.sessions().save(access, renewal, None).await.unwrap();
}

#[tokio::test]
async fn valid_credential_sends_one_bearer_header_and_normalizes_response() {
    let server = MockServer::start().await;
    let client = client_for(&server);
    let token = make_token("user-1", 3600);
    seed_session(&client, &token, None).await;

    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("Authorization", format!("Bearer {}", token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Id": "user-1",
            "DisplayName": "Dana",
            "Devices": [{"DeviceName": "laptop"}],
        })))
        .expect(1)
        .mount(&server)
        .await;

    let profile = client.api().get("/profile").await.unwrap();
    assert_eq!(profile["id"], "user-1");
    assert_eq!(profile["displayName"], "Dana");
    assert_eq!(profile["devices"][0]["deviceName"], "laptop");

    // Exactly one Authorization header on the outgoing request
    let requests = server.received_requests().await.unwrap();
    let bearer_values: Vec<_> = requests[0]
        .headers
        .get_all("authorization")
        .iter()
        .collect();
    assert_eq!(bearer_values.len(), 1);
}

#[tokio::test]
async fn csrf_header_rides_on_state_changing_requests_only() {
    let server = MockServer::start().await;
    let client = client_with_csrf(&server, "csrf-1");
    seed_session(&client, &make_token("user-1", 3600), None).await;

    Mock::given(method("POST"))
        .and(path("/consultations"))
        .and(header("X-CSRF-Token", "csrf-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Id": "c-1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/consultations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    client
        .api()
        .post("/consultations", json!({"reason": "checkup"}))
        .await
        .unwrap();
    client.api().get("/consultations").await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let get_request = requests
        .iter()
        .find(|r| r.method.as_str() == "GET")
        .unwrap();
    assert!(
        get_request.headers.get("x-csrf-token").is_none(),
        "safe requests must not carry the CSRF header"
    );
}

#[tokio::test]
async fn expired_access_token_refreshes_once_and_replays_the_request() {
    let server = MockServer::start().await;
    let client = client_for(&server);
    let stale = make_token("user-1", -60);
    let fresh = make_token("user-1", 3600);
    seed_session(&client, &stale, Some("renew-1")).await;

    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("Authorization", format!("Bearer {}", stale).as_str()))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"Message": "Token expired"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh-token"))
        .and(body_json(json!({"renewalToken": "renew-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "AccessToken": fresh,
            "RenewalToken": "renew-2",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("Authorization", format!("Bearer {}", fresh).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Id": "user-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let profile = client.api().get("/profile").await.unwrap();
    assert_eq!(profile["id"], "user-1");

    // The store now holds the replacement credential
    let held = client.sessions().access_token().unwrap();
    assert_eq!(held.expose_secret(), &fresh);
}

#[tokio::test]
async fn rejected_renewal_clears_the_store_and_surfaces_expired() {
    let server = MockServer::start().await;
    let client = client_for(&server);
    seed_session(&client, &make_token("user-1", -60), Some("renew-dead")).await;

    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"Message": "Nope"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh-token"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"Message": "Renewal revoked"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let error = client.api().get("/profile").await.unwrap_err();
    assert!(matches!(error, ClientError::AuthenticationExpired));
    assert!(client.sessions().load().is_none());
}

#[tokio::test]
async fn login_rejection_is_surfaced_verbatim_without_recovery() {
    let server = MockServer::start().await;
    let client = client_for(&server);

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"Message": "Bad credentials"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh-token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let error = client
        .login(LoginRequest {
            email: "demo@lumen.example".to_string(),
            password: "wrong".to_string(),
            device_name: None,
        })
        .await
        .unwrap_err();

    match error {
        ClientError::AuthenticationRejected(message) => assert_eq!(message, "Bad credentials"),
        other => panic!("expected AuthenticationRejected, got {:?}", other.status()),
    }
}

#[tokio::test]
async fn login_persists_session_and_subsequent_get_needs_no_recovery() {
    let server = MockServer::start().await;
    let client = client_for(&server);
    let token = make_token("user-9", 3600);

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "AccessToken": token,
            "RenewalToken": "renew-1",
            "User": {"Id": "user-9", "Email": "demo@lumen.example", "Role": "patient"},
            "Device": {"Name": "laptop", "Trusted": false, "NewDevice": true},
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("Authorization", format!("Bearer {}", token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Id": "user-9"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh-token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let session = client
        .login(LoginRequest {
            email: "demo@lumen.example".to_string(),
            password: "password".to_string(),
            device_name: Some("laptop".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(session.user.id, "user-9");
    assert_eq!(session.credential.subject, "user-9");
    assert!(session.device.new_device);
    assert!(!client.sessions().is_expired());

    client.api().get("/profile").await.unwrap();
}

#[tokio::test]
async fn stale_csrf_token_is_refreshed_once_and_the_post_succeeds() {
    let server = MockServer::start().await;
    let client = client_with_csrf(&server, "stale");
    seed_session(&client, &make_token("user-1", 3600), None).await;

    Mock::given(method("POST"))
        .and(path("/consultations"))
        .and(header("X-CSRF-Token", "stale"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "Message": "Invalid synchronizer token",
            "Code": "EBADCSRFTOKEN",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/csrf-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"CsrfToken": "fresh"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/consultations"))
        .and(header("X-CSRF-Token", "fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Id": "c-1"})))
        .expect(1)
        .mount(&server)
        .await;

    // The caller observes no error at all
    let created = client
        .api()
        .post("/consultations", json!({"reason": "checkup"}))
        .await
        .unwrap();
    assert_eq!(created["id"], "c-1");
}

#[tokio::test]
async fn forbidden_without_csrf_signal_is_access_denied_without_retry() {
    let server = MockServer::start().await;
    let client = client_with_csrf(&server, "csrf-1");
    seed_session(&client, &make_token("user-1", 3600), None).await;

    Mock::given(method("POST"))
        .and(path("/admin/reports"))
        .respond_with(
            ResponseTemplate::new(403).set_body_json(json!({"Message": "Clinicians only"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let error = client.api().post("/admin/reports", json!({})).await.unwrap_err();
    match error {
        ClientError::AccessDenied(message) => assert_eq!(message, "Clinicians only"),
        other => panic!("expected AccessDenied, got {:?}", other.status()),
    }
}

#[tokio::test]
async fn validation_errors_surface_per_field() {
    let server = MockServer::start().await;
    let client = client_with_csrf(&server, "csrf-1");
    seed_session(&client, &make_token("user-1", 3600), None).await;

    Mock::given(method("POST"))
        .and(path("/consultations"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "Message": "Validation failed",
            "Errors": {"Email": ["is required"], "Reason": ["too short"]},
        })))
        .mount(&server)
        .await;

    let error = client.api().post("/consultations", json!({})).await.unwrap_err();
    match error {
        ClientError::ValidationFailed {
            status,
            message,
            errors,
        } => {
            assert_eq!(status, 422);
            assert_eq!(message, "Validation failed");
            assert_eq!(errors["email"], vec!["is required".to_string()]);
            assert_eq!(errors["reason"], vec!["too short".to_string()]);
        }
        other => panic!("expected ValidationFailed, got {:?}", other.status()),
    }
}

#[tokio::test]
async fn empty_body_comes_back_as_an_empty_object() {
    let server = MockServer::start().await;
    let client = client_for(&server);
    seed_session(&client, &make_token("user-1", 3600), None).await;

    Mock::given(method("DELETE"))
        .and(path("/consultations/c-1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let body = client.api().delete("/consultations/c-1").await.unwrap();
    assert_eq!(body, json!({}));
}

#[tokio::test]
async fn html_login_page_in_a_2xx_triggers_the_auth_recovery_path() {
    let server = MockServer::start().await;
    let client = client_for(&server);
    let stale = make_token("user-1", 3600);
    let fresh = make_token("user-1", 7200);
    seed_session(&client, &stale, Some("renew-1")).await;

    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("Authorization", format!("Bearer {}", stale).as_str()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<!DOCTYPE html><html><body>Please sign in</body></html>"),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "AccessToken": fresh,
            "RenewalToken": "renew-2",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .and(header("Authorization", format!("Bearer {}", fresh).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Id": "user-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let profile = client.api().get("/profile").await.unwrap();
    assert_eq!(profile["id"], "user-1");
}

#[tokio::test]
async fn concurrent_401s_share_a_single_refresh() {
    let server = MockServer::start().await;
    let client = client_for(&server);
    let stale = make_token("user-1", -60);
    let fresh = make_token("user-1", 3600);
    seed_session(&client, &stale, Some("renew-1")).await;

    for endpoint in ["/a", "/b", "/c"] {
        Mock::given(method("GET"))
            .and(path(endpoint))
            .and(header("Authorization", format!("Bearer {}", stale).as_str()))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"Message": "expired"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(endpoint))
            .and(header("Authorization", format!("Bearer {}", fresh).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Ok": true})))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/auth/refresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "AccessToken": fresh,
            "RenewalToken": "renew-2",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (a, b, c) = tokio::join!(
        client.api().get("/a"),
        client.api().get("/b"),
        client.api().get("/c"),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
}

#[tokio::test]
async fn malformed_success_body_is_a_contract_violation() {
    let server = MockServer::start().await;
    let client = client_for(&server);
    seed_session(&client, &make_token("user-1", 3600), None).await;

    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(200).set_body_string("definitely not json"))
        .mount(&server)
        .await;

    let error = client.api().get("/profile").await.unwrap_err();
    assert!(matches!(error, ClientError::MalformedResponse(_)));
}

#[tokio::test]
async fn file_upload_carries_credentials_and_returns_normalized_body() {
    let server = MockServer::start().await;
    let client = client_with_csrf(&server, "csrf-1");
    let token = make_token("user-1", 3600);
    seed_session(&client, &token, None).await;

    Mock::given(method("POST"))
        .and(path("/documents"))
        .and(header("Authorization", format!("Bearer {}", token).as_str()))
        .and(header("X-CSRF-Token", "csrf-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"DocumentId": "d-1"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let uploaded = client
        .api()
        .upload_file(
            "/documents",
            lumenx::FileUpload::new("scan.pdf", "application/pdf", b"%PDF-1.7".to_vec()),
            &[("category", "lab-results")],
        )
        .await
        .unwrap();
    assert_eq!(uploaded["documentId"], "d-1");
}

#[tokio::test]
async fn logout_clears_local_state_even_when_the_server_is_down() {
    let server = MockServer::start().await;
    let client = client_for(&server);
    seed_session(&client, &make_token("user-1", 3600), Some("renew-1")).await;

    // No /auth/logout mock mounted: the request 404s
    client.logout().await;
    assert!(client.sessions().load().is_none());
}
