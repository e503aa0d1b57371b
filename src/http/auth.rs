//! HTTP Basic authentication extraction.
//!
//! The gateway does not verify credentials itself; it forwards the user name
//! and token to the IOMgr, which owns authentication. This module only parses
//! the `Authorization` header, strictly: anything that is not well-formed
//! Basic comes back as 401 without touching a pooled connection.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingHeader,

    #[error("malformed Authorization header")]
    Malformed,

    #[error("unsupported authorization scheme, expecting Basic")]
    UnsupportedScheme,

    #[error("invalid Basic credentials")]
    InvalidCredentials,
}

/// Extracts `(user_name, token)` from an HTTP Basic `Authorization` header.
pub fn basic_credentials(headers: &HeaderMap) -> Result<(String, String), AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|_| AuthError::Malformed)?;

    let mut tokens = value.split_whitespace();
    let (Some(scheme), Some(encoded), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err(AuthError::Malformed);
    };
    if scheme != "Basic" {
        return Err(AuthError::UnsupportedScheme);
    }

    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| AuthError::InvalidCredentials)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidCredentials)?;
    // Some clients pipe the credential blob through a tool that appends a
    // newline before encoding; strip exactly one.
    let decoded = decoded.strip_suffix('\n').unwrap_or(&decoded);

    let mut parts = decoded.split(':');
    let (Some(user_name), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(AuthError::InvalidCredentials);
    };
    Ok((user_name.to_owned(), token.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn basic(credentials: &str) -> HeaderMap {
        headers_with(&format!("Basic {}", STANDARD.encode(credentials)))
    }

    #[test]
    fn parses_user_and_token() {
        let (user, token) = basic_credentials(&basic("root:s3cr3t")).unwrap();
        assert_eq!(user, "root");
        assert_eq!(token, "s3cr3t");
    }

    #[test]
    fn strips_exactly_one_trailing_newline() {
        let (user, token) = basic_credentials(&basic("root:s3cr3t\n")).unwrap();
        assert_eq!(user, "root");
        assert_eq!(token, "s3cr3t");

        // A second newline stays and makes the token unusual but legal.
        let (_, token) = basic_credentials(&basic("root:s3cr3t\n\n")).unwrap();
        assert_eq!(token, "s3cr3t\n");
    }

    #[test]
    fn missing_header() {
        assert_eq!(
            basic_credentials(&HeaderMap::new()).unwrap_err(),
            AuthError::MissingHeader
        );
    }

    #[test]
    fn rejects_other_schemes() {
        assert_eq!(
            basic_credentials(&headers_with("Bearer abcdef")).unwrap_err(),
            AuthError::UnsupportedScheme
        );
    }

    #[test]
    fn rejects_wrong_token_count() {
        assert_eq!(
            basic_credentials(&headers_with("Basic")).unwrap_err(),
            AuthError::Malformed
        );
        assert_eq!(
            basic_credentials(&headers_with("Basic a b")).unwrap_err(),
            AuthError::Malformed
        );
    }

    #[test]
    fn rejects_bad_base64() {
        assert_eq!(
            basic_credentials(&headers_with("Basic ???")).unwrap_err(),
            AuthError::InvalidCredentials
        );
    }

    #[test]
    fn rejects_wrong_colon_count() {
        assert_eq!(
            basic_credentials(&basic("rootonly")).unwrap_err(),
            AuthError::InvalidCredentials
        );
        assert_eq!(
            basic_credentials(&basic("a:b:c")).unwrap_err(),
            AuthError::InvalidCredentials
        );
    }

    #[test]
    fn empty_token_is_allowed() {
        let (user, token) = basic_credentials(&basic("root:")).unwrap();
        assert_eq!(user, "root");
        assert_eq!(token, "");
    }
}
