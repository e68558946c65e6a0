//! Field validation helpers shared by developer key validations.

use serde_json::Value;
use std::borrow::Cow;
use url::Url;
use validator::ValidationError;

/// Longest redirect URI accepted on a key.
pub const MAX_REDIRECT_URI_LENGTH: usize = 4096;

/// Build a field error with a human readable message.
pub fn field_error(code: &'static str, message: impl Into<Cow<'static, str>>) -> ValidationError {
    let mut error = ValidationError::new(code);
    error.message = Some(message.into());
    error
}

/// Validate a URI, assuming `http://` when the value carries no scheme.
///
/// Any absolute URI is accepted, including hostless ones such as
/// `urn:ietf:wg:oauth:2.0:oob` or `myapp:callback`. Returns the value that
/// should be stored: trimmed, and prefixed when the scheme was missing.
pub fn validate_url(value: &str) -> Result<String, url::ParseError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(url::ParseError::EmptyHost);
    }

    match Url::parse(value) {
        Ok(_) => Ok(value.to_string()),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let prefixed = format!("http://{}", value);
            Url::parse(&prefixed)?;
            Ok(prefixed)
        }
        Err(e) => Err(e),
    }
}

/// Scheme, lowercased host and non-default port of a URI.
pub fn normalized_site(uri: &str) -> Option<String> {
    let parsed = Url::parse(uri.trim()).ok()?;
    let host = parsed.host_str().filter(|h| !h.is_empty())?;
    let mut site = format!("{}://{}", parsed.scheme(), host.to_lowercase());
    if let Some(port) = parsed.port() {
        site.push_str(&format!(":{}", port));
    }
    Some(site)
}

const REQUIRED_JWK_MEMBERS: [&str; 6] = ["kty", "e", "n", "kid", "alg", "use"];

/// Validate an LTI public JWK. Returns one message per problem found.
pub fn public_jwk_errors(jwk: &Value) -> Vec<String> {
    let Some(members) = jwk.as_object() else {
        return vec!["must be a JSON object".to_string()];
    };

    let mut errors: Vec<String> = REQUIRED_JWK_MEMBERS
        .iter()
        .filter(|member| !members.get(**member).is_some_and(|v| v.is_string()))
        .map(|member| format!("missing required property '{}'", member))
        .collect();

    let expected = [("kty", "RSA"), ("alg", "RS256"), ("use", "sig")];
    for (member, value) in expected {
        if let Some(actual) = members.get(member).and_then(Value::as_str) {
            if actual != value {
                errors.push(format!("property '{}' must be '{}'", member, value));
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_url_prefixes_missing_scheme() {
        assert_eq!(validate_url("example.com/cb").unwrap(), "http://example.com/cb");
        assert_eq!(validate_url(" https://x.com ").unwrap(), "https://x.com");
    }

    #[test]
    fn test_validate_url_rejects_empty_values() {
        assert!(validate_url("").is_err());
        assert!(validate_url("   ").is_err());
        assert!(validate_url("http://").is_err());
    }

    #[test]
    fn test_validate_url_accepts_hostless_schemes() {
        assert_eq!(
            validate_url("urn:ietf:wg:oauth:2.0:oob").unwrap(),
            "urn:ietf:wg:oauth:2.0:oob"
        );
        assert_eq!(validate_url("myapp:callback").unwrap(), "myapp:callback");
    }

    #[test]
    fn test_normalized_site_drops_default_port_and_path() {
        assert_eq!(
            normalized_site("HTTPS://Example.com:443/callback?x=1").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalized_site("http://example.com:8080/cb").as_deref(),
            Some("http://example.com:8080")
        );
        assert_eq!(normalized_site("not a uri"), None);
    }

    #[test]
    fn test_public_jwk_errors() {
        let valid = json!({
            "kty": "RSA", "e": "AQAB", "n": "abc", "kid": "k1", "alg": "RS256", "use": "sig"
        });
        assert!(public_jwk_errors(&valid).is_empty());

        let invalid = json!({ "kty": "EC", "e": "AQAB" });
        let errors = public_jwk_errors(&invalid);
        assert!(errors.contains(&"missing required property 'kid'".to_string()));
        assert!(errors.contains(&"property 'kty' must be 'RSA'".to_string()));
    }
}
