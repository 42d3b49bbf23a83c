//! Multipart upload header validation.
//!
//! Runs before a multipart body is forwarded so a malformed upload fails
//! fast instead of tying up an upstream connection. Every check runs and
//! every defect is reported.

use axum::http::{header, HeaderMap};
use serde::Serialize;

const MULTIPART_TYPES: [&str; 4] = [
    "multipart/form-data",
    "multipart/mixed",
    "multipart/alternative",
    "multipart/related",
];

const MAX_BOUNDARY_LEN: usize = 70;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
}

fn is_multipart_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    MULTIPART_TYPES.iter().any(|t| lower.contains(t))
}

/// Whether the request declares a multipart content type with a valid boundary.
pub fn is_valid_multipart(headers: &HeaderMap) -> bool {
    content_type(headers).is_some_and(|ct| is_multipart_type(ct) && has_valid_boundary(ct))
}

/// The `boundary` parameter of a content type, quotes removed.
pub fn extract_boundary(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.trim_start().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim_end();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        Some(value)
    })
}

fn is_boundary_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "'()+_,-./:=?".contains(c)
}

/// Whether the content type carries a 1–70 character boundary of allowed characters.
pub fn has_valid_boundary(content_type: &str) -> bool {
    extract_boundary(content_type).is_some_and(|b| {
        !b.is_empty() && b.len() <= MAX_BOUNDARY_LEN && b.chars().all(is_boundary_char)
    })
}

/// Check every header an upload depends on.
pub fn validate_upload_headers(headers: &HeaderMap) -> UploadValidation {
    let mut errors = Vec::new();

    match content_type(headers) {
        None => errors.push("missing Content-Type header".to_string()),
        Some(ct) => {
            if !is_multipart_type(ct) {
                errors.push(format!("unsupported content type for upload: {}", ct));
            }
            match extract_boundary(ct) {
                None => errors.push("missing multipart boundary".to_string()),
                Some(_) if !has_valid_boundary(ct) => {
                    errors.push("invalid multipart boundary".to_string())
                }
                Some(_) => {}
            }
        }
    }

    if let Some(value) = headers.get(header::CONTENT_LENGTH) {
        let positive = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .is_some_and(|len| len > 0);
        if !positive {
            errors.push("Content-Length must be a positive integer".to_string());
        }
    }

    if let Some(value) = headers.get(header::TRANSFER_ENCODING) {
        let chunked = value
            .to_str()
            .is_ok_and(|v| v.trim().eq_ignore_ascii_case("chunked"));
        if !chunked {
            errors.push("unsupported Transfer-Encoding; only chunked is accepted".to_string());
        }
    }

    UploadValidation {
        valid: errors.is_empty(),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    #[test]
    fn test_boundary_examples() {
        assert!(has_valid_boundary(
            "multipart/form-data; boundary=----WebKitFormBoundary7MA4YWxkTrZu0gW"
        ));
        assert!(!has_valid_boundary("multipart/form-data; boundary=abc def"));
        let long = format!("multipart/form-data; boundary={}", "a".repeat(100));
        assert!(!has_valid_boundary(&long));
        assert!(!has_valid_boundary("multipart/form-data"));
        assert!(!has_valid_boundary("multipart/form-data; boundary="));
    }

    #[test]
    fn test_extract_boundary() {
        assert_eq!(
            extract_boundary("multipart/mixed; charset=utf-8; boundary=\"simple:boundary\""),
            Some("simple:boundary")
        );
        assert_eq!(extract_boundary("multipart/form-data; BOUNDARY=x1"), Some("x1"));
        assert_eq!(extract_boundary("text/plain"), None);
    }

    #[test]
    fn test_is_valid_multipart() {
        let ok = headers(&[(header::CONTENT_TYPE, "Multipart/Form-Data; boundary=xyz")]);
        assert!(is_valid_multipart(&ok));

        let json = headers(&[(header::CONTENT_TYPE, "application/json; boundary=xyz")]);
        assert!(!is_valid_multipart(&json));
        assert!(!is_valid_multipart(&HeaderMap::new()));
    }

    #[test]
    fn test_valid_upload() {
        let result = validate_upload_headers(&headers(&[
            (header::CONTENT_TYPE, "multipart/related; boundary=part"),
            (header::CONTENT_LENGTH, "2048"),
            (header::TRANSFER_ENCODING, "chunked"),
        ]));
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_errors_accumulate() {
        let result = validate_upload_headers(&headers(&[
            (header::CONTENT_TYPE, "multipart/form-data"),
            (header::CONTENT_LENGTH, "0"),
            (header::TRANSFER_ENCODING, "gzip"),
        ]));
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 3);
        assert!(result.errors[0].contains("boundary"));
    }

    #[test]
    fn test_missing_content_type() {
        let result = validate_upload_headers(&HeaderMap::new());
        assert!(!result.valid);
        assert_eq!(result.errors, vec!["missing Content-Type header".to_string()]);
    }
}
