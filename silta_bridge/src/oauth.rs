//! No-auth OAuth metadata surface.
//!
//! Strict MCP clients run OAuth discovery before opening an SSE
//! session and refuse to proceed unless every advertised URL is a
//! valid non-null string. The bridge therefore serves a complete
//! OAuth 2.1 metadata document, a dummy dynamic-registration
//! endpoint, and a placeholder authorize/token endpoint, even with
//! authentication disabled. None of these endpoints gate anything.

use serde::Serialize;
use serde_json::{Value, json};

/// OAuth 2.0 Authorization Server Metadata (RFC 8414), restricted to
/// the fields strict clients validate. Every URL field is a concrete
/// string, never null or absent.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: String,
    pub response_types_supported: Vec<&'static str>,
    pub grant_types_supported: Vec<&'static str>,
    pub token_endpoint_auth_methods_supported: Vec<&'static str>,
    pub code_challenge_methods_supported: Vec<&'static str>,
    pub scopes_supported: Vec<&'static str>,
}

pub fn authorization_server_metadata(base: &str) -> AuthorizationServerMetadata {
    let base = base.trim_end_matches('/');
    AuthorizationServerMetadata {
        issuer: base.to_string(),
        authorization_endpoint: format!("{base}/no-auth-required"),
        token_endpoint: format!("{base}/no-auth-required"),
        registration_endpoint: format!("{base}/register"),
        response_types_supported: vec!["code"],
        grant_types_supported: vec!["authorization_code"],
        token_endpoint_auth_methods_supported: vec!["none"],
        code_challenge_methods_supported: vec!["S256"],
        scopes_supported: vec!["mcp"],
    }
}

/// OAuth protected-resource metadata document.
pub fn protected_resource_metadata(base: &str) -> Value {
    let base = base.trim_end_matches('/');
    json!({
        "resource": base,
        "authorization_servers": [base],
        "bearer_methods_supported": ["header"],
        "scopes_supported": ["mcp"],
    })
}

/// Dummy dynamic client registration response. Strict clients require
/// at minimum `client_id` and `redirect_uris`.
pub fn registration_response(body: Option<&Value>) -> Value {
    let redirect_uris = body
        .and_then(|b| b.get("redirect_uris"))
        .and_then(|v| v.as_array())
        .filter(|uris| !uris.is_empty())
        .cloned()
        .unwrap_or_else(|| vec![json!("http://localhost/callback")]);
    json!({
        "client_id": "silta-no-auth-client",
        "client_secret": "",
        "redirect_uris": redirect_uris,
        "token_endpoint_auth_method": "none",
        "grant_types": ["authorization_code"],
        "response_types": ["code"],
    })
}

/// Body for any hit on the placeholder authorize/token endpoint.
pub fn no_auth_required_response() -> Value {
    json!({
        "error": "no_authentication_required",
        "error_description": "this bridge does not require authentication",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_metadata_url_is_a_non_empty_string() {
        let metadata = authorization_server_metadata("http://localhost:3000/");
        let doc = serde_json::to_value(&metadata).unwrap();
        for field in [
            "issuer",
            "authorization_endpoint",
            "token_endpoint",
            "registration_endpoint",
        ] {
            let value = doc.get(field).unwrap();
            assert!(
                value.as_str().is_some_and(|s| !s.is_empty()),
                "{field} must be a non-empty string, got {value}"
            );
        }
        assert_eq!(doc["response_types_supported"], json!(["code"]));
        assert_eq!(doc["grant_types_supported"], json!(["authorization_code"]));
    }

    #[test]
    fn trailing_slash_does_not_double_up() {
        let metadata = authorization_server_metadata("http://h:1/");
        assert_eq!(metadata.registration_endpoint, "http://h:1/register");
    }

    #[test]
    fn registration_echoes_client_redirect_uris() {
        let body = json!({"redirect_uris": ["http://127.0.0.1:7777/cb"]});
        let response = registration_response(Some(&body));
        assert_eq!(response["client_id"], "silta-no-auth-client");
        assert_eq!(response["redirect_uris"][0], "http://127.0.0.1:7777/cb");
    }

    #[test]
    fn registration_defaults_when_body_is_absent() {
        let response = registration_response(None);
        assert!(response["redirect_uris"].as_array().is_some_and(|a| !a.is_empty()));
    }

    #[test]
    fn placeholder_endpoint_reports_no_auth_required() {
        assert_eq!(
            no_auth_required_response()["error"],
            "no_authentication_required"
        );
    }
}
