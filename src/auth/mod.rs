use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};


/// Username and password from an HTTP Basic `Authorization` header.
#[derive(Debug, PartialEq, Clone)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    /// Compares against the configured admin credentials.
    pub fn matches(&self, username: &str, password: &str) -> bool {
        // Evaluate both so timing does not reveal which one differed
        let user_ok = constant_time_eq(self.username.as_bytes(), username.as_bytes());
        let pass_ok = constant_time_eq(self.password.as_bytes(), password.as_bytes());
        user_ok & pass_ok
    }
}

/// Extract Basic credentials from HTTP Authorization header
///
/// Expected format: "Authorization: Basic base64(username:password)"
pub fn extract_basic_credentials(headers: &HeaderMap) -> Result<BasicCredentials, BasicAuthError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(BasicAuthError::Missing)?
        .to_str()
        .map_err(|_| BasicAuthError::InvalidFormat)?;

    parse_basic_credentials(auth_header)
}

/// Parse "Basic <base64>" header value
fn parse_basic_credentials(header_value: &str) -> Result<BasicCredentials, BasicAuthError> {
    let parts: Vec<&str> = header_value.splitn(2, ' ').collect();

    if parts.len() != 2 {
        return Err(BasicAuthError::InvalidFormat);
    }

    if parts[0].to_lowercase() != "basic" {
        return Err(BasicAuthError::InvalidFormat);
    }

    let encoded = parts[1].trim();
    if encoded.is_empty() {
        return Err(BasicAuthError::InvalidFormat);
    }

    let decoded = BASE64
        .decode(encoded)
        .map_err(|_| BasicAuthError::InvalidEncoding)?;
    let decoded = String::from_utf8(decoded).map_err(|_| BasicAuthError::InvalidEncoding)?;

    // Password may itself contain ':'
    let (username, password) = decoded
        .split_once(':')
        .ok_or(BasicAuthError::InvalidFormat)?;

    Ok(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Basic auth extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum BasicAuthError {
    /// Authorization header not present
    Missing,
    /// Not "Basic <credentials>" or no ':' separator
    InvalidFormat,
    /// Credentials are not valid base64 or UTF-8
    InvalidEncoding,
}

impl std::fmt::Display for BasicAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BasicAuthError::Missing => write!(f, "Authorization header not provided"),
            BasicAuthError::InvalidFormat => write!(f, "Invalid basic authorization format"),
            BasicAuthError::InvalidEncoding => write!(f, "Invalid basic authorization encoding"),
        }
    }
}

impl std::error::Error for BasicAuthError {}
