//! Mapping from a finished request to its success payload or typed error.

use http::Method;
use serde_json::Value;

use crate::error::{ErrorKind, RequestError};
use crate::request::{is_json_type, XmlDocument};
use crate::response::Payload;

/// Everything classification looks at once a request reached `Done`
#[derive(Debug, Clone)]
pub struct CompletedResponse {
    pub status: u16,
    pub method: Method,
    pub url: String,
    pub mime_type: String,
    pub location: Option<String>,
    pub response_text: Option<String>,
    pub response_xml: Option<XmlDocument>,
}

/// Classify a finished request
///
/// The first matching rule wins:
///
/// | status | outcome |
/// |---|---|
/// | 200, 201 | success |
/// | 301, 307 | redirect, with the new location |
/// | other below 400 | redirect |
/// | 401, 419 | not authorized |
/// | 404 | not found |
/// | 409 | resource state conflict |
/// | 415 | unsupported media type |
/// | 422 | client validation, carrying the parsed body |
/// | 429, 420 | request limit exceeded |
/// | other below 500 | client error |
/// | 503 | service unavailable |
/// | 504 | gateway timeout |
/// | anything else | server error |
///
/// A success body that is not valid JSON while JSON was asked for is a
/// [`ErrorKind::ResponseParse`] error rather than a null payload.
pub fn classify(response: &CompletedResponse) -> Result<Payload, RequestError> {
    let status = response.status;
    let url = response.url.as_str();
    let location = response.location.as_deref().unwrap_or("");

    let error = match status {
        200 | 201 => return success_payload(response).map_err(|e| e.with_status(status)),
        301 => RequestError::new(
            ErrorKind::Redirect,
            format!("The resource at {} has moved permanently to: {}", url, location),
        ),
        307 => RequestError::new(
            ErrorKind::Redirect,
            format!("The resource at {} has moved temporarily to: {}", url, location),
        ),
        s if s < 400 => RequestError::new(
            ErrorKind::Redirect,
            format!("Server returned a redirect error: {}", s),
        ),
        401 | 419 => RequestError::new(
            ErrorKind::NotAuthorized,
            format!("Authentication required for requests to {} {}", response.method, url),
        ),
        404 => RequestError::new(
            ErrorKind::NotFound,
            format!("Server returned 404 Not Found for {}", url),
        ),
        409 => RequestError::new(
            ErrorKind::ResourceStateConflict,
            format!("The resource at {} has been modified.", url),
        ),
        415 => RequestError::new(ErrorKind::UnsupportedMediaType, "Invalid media type"),
        422 => RequestError::validation(
            "Validation errors occurred while processing this request",
            response
                .response_text
                .as_deref()
                .and_then(|text| serde_json::from_str::<Value>(text).ok()),
        ),
        429 | 420 => RequestError::new(ErrorKind::RequestLimitExceeded, "Request limit exceeded"),
        s if s < 500 => RequestError::new(
            ErrorKind::Client,
            format!("Server returned client error {}", s),
        ),
        503 => RequestError::new(
            ErrorKind::ServiceUnavailable,
            format!("Service to {} is temporarily unavailable.", url),
        ),
        504 => RequestError::new(
            ErrorKind::GatewayTimeout,
            "The server timed out waiting for another resource.",
        ),
        s => RequestError::new(ErrorKind::Server, format!("Server error {}", s)),
    };

    Err(error.with_status(status))
}

fn success_payload(response: &CompletedResponse) -> Result<Payload, RequestError> {
    if let Some(document) = &response.response_xml {
        return Ok(Payload::Xml(document.clone()));
    }

    let text = response.response_text.clone().unwrap_or_default();
    match parse_response_text(&text, &response.mime_type)? {
        Some(payload) => Ok(payload),
        None => Ok(Payload::Text(text)),
    }
}

/// Best-effort parse of a response body according to the request mime type
///
/// JSON syntax errors are returned; any other failure, and a body that
/// parses to a falsy value (`null`, `false`, `0`, `""`), yields `None`.
pub fn parse_response_text(
    text: &str,
    mime_type: &str,
) -> Result<Option<Payload>, serde_json::Error> {
    if text.is_empty() {
        return Ok(None);
    }
    if !is_json_type(mime_type) {
        return Ok(Some(Payload::Text(text.to_string())));
    }

    match serde_json::from_str::<Value>(text) {
        Ok(value) if is_falsy(&value) => Ok(None),
        Ok(value) => Ok(Some(Payload::Json(value))),
        Err(err) if err.is_syntax() || err.is_eof() => Err(err),
        Err(_) => Ok(None),
    }
}

/// `null`, `false`, zero and the empty string carry no payload of their own
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{TYPE_JSON, TYPE_TEXT};
    use serde_json::json;

    fn response(status: u16, text: &str) -> CompletedResponse {
        CompletedResponse {
            status,
            method: Method::GET,
            url: "http://example.com/items".to_string(),
            mime_type: TYPE_JSON.to_string(),
            location: None,
            response_text: Some(text.to_string()),
            response_xml: None,
        }
    }

    fn kind(status: u16) -> ErrorKind {
        classify(&response(status, "")).unwrap_err().kind()
    }

    #[test]
    fn test_success_json() {
        let payload = classify(&response(200, r#"{"a":1}"#)).unwrap();
        assert_eq!(payload, Payload::Json(json!({"a": 1})));
        assert!(classify(&response(201, "[1]")).is_ok());
    }

    #[test]
    fn test_success_malformed_json_is_parse_error() {
        let error = classify(&response(200, "{not json")).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ResponseParse);
        assert_eq!(error.status(), Some(200));
    }

    #[test]
    fn test_success_empty_or_null_body_falls_back_to_text() {
        assert_eq!(classify(&response(200, "")).unwrap(), Payload::Text(String::new()));
        assert_eq!(classify(&response(200, "null")).unwrap(), Payload::Text("null".into()));
    }

    #[test]
    fn test_success_falsy_json_falls_back_to_text() {
        for body in ["false", "0", "0.0", r#""""#] {
            assert_eq!(classify(&response(200, body)).unwrap(), Payload::Text(body.into()));
        }
        assert_eq!(classify(&response(200, "true")).unwrap(), Payload::Json(Value::Bool(true)));
        assert_eq!(classify(&response(200, "1")).unwrap(), Payload::Json(1.into()));
        assert_eq!(classify(&response(200, "[]")).unwrap(), Payload::Json(json!([])));
    }

    #[test]
    fn test_success_plain_text() {
        let mut plain = response(200, "hello");
        plain.mime_type = TYPE_TEXT.to_string();
        assert_eq!(classify(&plain).unwrap(), Payload::Text("hello".into()));
    }

    #[test]
    fn test_success_prefers_xml() {
        let mut xml = response(200, "<a/>");
        xml.response_xml = Some(XmlDocument::new("<a/>"));
        assert_eq!(classify(&xml).unwrap(), Payload::Xml(XmlDocument::new("<a/>")));
    }

    #[test]
    fn test_redirects() {
        let mut moved = response(301, "");
        moved.location = Some("http://example.com/new".to_string());
        let error = classify(&moved).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Redirect);
        assert!(error.message().contains("moved permanently to: http://example.com/new"));

        let mut temporary = response(307, "");
        temporary.location = Some("/tmp".to_string());
        assert!(classify(&temporary).unwrap_err().message().contains("moved temporarily"));

        assert_eq!(kind(302), ErrorKind::Redirect);
        assert_eq!(kind(304), ErrorKind::Redirect);
        assert_eq!(kind(204), ErrorKind::Redirect);
        assert_eq!(kind(0), ErrorKind::Redirect);
    }

    #[test]
    fn test_client_errors() {
        assert_eq!(kind(401), ErrorKind::NotAuthorized);
        assert_eq!(kind(419), ErrorKind::NotAuthorized);
        assert_eq!(kind(404), ErrorKind::NotFound);
        assert_eq!(kind(409), ErrorKind::ResourceStateConflict);
        assert_eq!(kind(415), ErrorKind::UnsupportedMediaType);
        assert_eq!(kind(422), ErrorKind::ClientValidation);
        assert_eq!(kind(429), ErrorKind::RequestLimitExceeded);
        assert_eq!(kind(420), ErrorKind::RequestLimitExceeded);
        assert_eq!(kind(400), ErrorKind::Client);
        assert_eq!(kind(418), ErrorKind::Client);

        let error = classify(&response(404, "")).unwrap_err();
        assert!(error.is_client_error());
        assert_eq!(error.status(), Some(404));
        assert_eq!(
            error.message(),
            "Server returned 404 Not Found for http://example.com/items"
        );
    }

    #[test]
    fn test_validation_messages() {
        let error = classify(&response(422, r#"{"name":["is required"]}"#)).unwrap_err();
        assert_eq!(
            error.validation_messages(),
            Some(&json!({"name": ["is required"]}))
        );

        let error = classify(&response(422, "<html>")).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ClientValidation);
        assert_eq!(error.validation_messages(), None);
    }

    #[test]
    fn test_server_errors() {
        assert_eq!(kind(503), ErrorKind::ServiceUnavailable);
        assert_eq!(kind(504), ErrorKind::GatewayTimeout);
        assert_eq!(kind(500), ErrorKind::Server);
        assert_eq!(kind(599), ErrorKind::Server);
        assert_eq!(kind(600), ErrorKind::Server);
        assert!(classify(&response(503, "")).unwrap_err().is_server_error());
    }

    #[test]
    fn test_not_authorized_message_names_method() {
        let error = classify(&response(401, "")).unwrap_err();
        assert_eq!(
            error.message(),
            "Authentication required for requests to GET http://example.com/items"
        );
    }
}
