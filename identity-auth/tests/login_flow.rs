//! End-to-end login against a mocked Google-style OIDC provider.

use std::collections::BTreeMap;

use identity_auth::providers::{OidcSettings, Protocol, ProviderFamily};
use identity_auth::{
    AuthOutcome, AuthService, AuthorizationParams, ErrorKind, ProviderConfig, Settings,
};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use mockito::{Matcher, Server, ServerGuard};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

const SIGNING_KEY: &str = include_str!("fixtures/signing_key.pem");
const JWKS: &str = include_str!("fixtures/jwks.json");

fn google_provider(server: &ServerGuard) -> ProviderConfig {
    let base = server.url();
    ProviderConfig {
        id: "google-oauth2".to_string(),
        organization_id: "acme".to_string(),
        family: ProviderFamily::Google,
        client_id: "acme-web".to_string(),
        client_secret: SecretString::new("acme-secret".to_string()),
        authorization_url: format!("{base}/o/oauth2/v2/auth"),
        token_url: format!("{base}/token"),
        user_info_url: Some(format!("{base}/userinfo")),
        jwks_url: Some(format!("{base}/oauth2/v3/certs")),
        revocation_url: None,
        scopes: vec![
            "openid".to_string(),
            "email".to_string(),
            "profile".to_string(),
        ],
        redirect_uri: "https://acme.example.com/auth/google/callback".to_string(),
        additional_params: BTreeMap::new(),
        enabled: true,
        protocol: Protocol::Oidc(OidcSettings::new(base)),
    }
}

fn signed_id_token(issuer: &str, nonce: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = serde_json::json!({
        "iss": issuer,
        "aud": "acme-web",
        "sub": "108234567890123456789",
        "email": "marie@acme.example.com",
        "email_verified": true,
        "name": "Marie Curie",
        "given_name": "Marie",
        "family_name": "Curie",
        "iat": now,
        "exp": now + 3600,
        "nonce": nonce,
    });
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("test-key-1".to_string());
    encode(
        &header,
        &claims,
        &EncodingKey::from_rsa_pem(SIGNING_KEY.as_bytes()).unwrap(),
    )
    .unwrap()
}

fn service() -> AuthService {
    AuthService::builder()
        .with_settings(Settings {
            http_max_retries: 0,
            ..Settings::default()
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_google_login_uses_id_token_claims() {
    let mut server = Server::new_async().await;
    let issuer = server.url();
    let service = service();
    service
        .configure_provider(google_provider(&server))
        .await
        .unwrap();

    let request = service
        .generate_authorization_url("google-oauth2", AuthorizationParams::default())
        .await
        .unwrap();

    let url = Url::parse(&request.url).unwrap();
    let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
    assert_eq!(url.path(), "/o/oauth2/v2/auth");
    assert_eq!(query["response_type"], "code");
    assert_eq!(query["client_id"], "acme-web");
    assert_eq!(query["code_challenge_method"], "S256");
    assert_eq!(query["scope"], "openid email profile");
    let nonce = request.nonce.clone().unwrap();
    assert_eq!(query["nonce"], nonce);

    let token = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("code".into(), "4/0AX4XfWg".into()),
            Matcher::UrlEncoded(
                "code_verifier".into(),
                request.code_verifier.expose_secret().clone(),
            ),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            serde_json::json!({
                "access_token": "ya29.a0AfH6SM",
                "expires_in": 3599,
                "refresh_token": "1//0g-refresh",
                "scope": "openid email profile",
                "token_type": "Bearer",
                "id_token": signed_id_token(&issuer, &nonce),
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let certs = server
        .mock("GET", "/oauth2/v3/certs")
        .with_status(200)
        .with_body(JWKS)
        .expect(1)
        .create_async()
        .await;
    let userinfo = server
        .mock("GET", "/userinfo")
        .expect(0)
        .create_async()
        .await;

    let result = service
        .exchange_code_for_tokens("google-oauth2", "4/0AX4XfWg", &request.state, None)
        .await
        .unwrap();

    assert_eq!(result.user.email.as_deref(), Some("marie@acme.example.com"));
    assert_eq!(result.user.subject, "108234567890123456789");
    assert_eq!(result.user.first_name.as_deref(), Some("Marie"));
    assert_eq!(result.user.email_verified, Some(true));
    assert_eq!(
        result.tokens.refresh_token.as_ref().map(|t| t.expose_secret().as_str()),
        Some("1//0g-refresh")
    );

    token.assert_async().await;
    certs.assert_async().await;
    userinfo.assert_async().await;

    // The state was consumed by the first exchange.
    let replay = service
        .exchange_code_for_tokens("google-oauth2", "4/0AX4XfWg", &request.state, None)
        .await;
    let outcome = AuthOutcome::from(replay);
    assert!(!outcome.success);
    token.assert_async().await;
}

#[tokio::test]
async fn test_forged_state_makes_no_network_call() {
    let mut server = Server::new_async().await;
    let token = server
        .mock("POST", "/token")
        .expect(0)
        .create_async()
        .await;

    let service = service();
    service
        .configure_provider(google_provider(&server))
        .await
        .unwrap();

    let err = service
        .exchange_code_for_tokens("google-oauth2", "code", "0123456789abcdef", None)
        .await
        .unwrap_err();
    assert!(matches!(err.error_kind, ErrorKind::State(_)));
    token.assert_async().await;
}

#[tokio::test]
async fn test_provider_reads_never_expose_secret() {
    let server = Server::new_async().await;
    let service = service();
    service
        .configure_provider(google_provider(&server))
        .await
        .unwrap();

    let listed = service.list_providers("acme");
    assert_eq!(listed.len(), 1);
    assert_ne!(listed[0].client_secret.expose_secret(), "acme-secret");

    let json = serde_json::to_string(&service.get_provider("google-oauth2").unwrap()).unwrap();
    assert!(!json.contains("acme-secret"));
}
