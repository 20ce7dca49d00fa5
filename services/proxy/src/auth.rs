//! Proxy credential checks.
//!
//! A front-end is configured with exactly one username/password pair. Checks
//! are pure functions of their inputs; every malformed or mismatching input is
//! rejected the same way so callers cannot tell the failure modes apart.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use subtle::ConstantTimeEq;

/// Authorization scheme prefix accepted in `Proxy-Authorization`.
pub const BASIC_SCHEME: &str = "Basic ";

/// The single identity a front-end accepts.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Create credentials from a username/password pair.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Configured username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Exact, case-sensitive match of a username/password pair.
    pub fn check(&self, username: &[u8], password: &[u8]) -> bool {
        let user_ok = self.username.as_bytes().ct_eq(username);
        let pass_ok = self.password.as_bytes().ct_eq(password);
        (user_ok & pass_ok).into()
    }

    /// Validate a raw `Proxy-Authorization` header value.
    pub fn check_basic(&self, header: &str) -> bool {
        let Some(encoded) = header.strip_prefix(BASIC_SCHEME) else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded) else {
            return false;
        };
        let Some(sep) = decoded.iter().position(|&b| b == b':') else {
            return false;
        };
        self.check(&decoded[..sep], &decoded[sep + 1..])
    }

    /// Header value a client would send for these credentials.
    pub fn basic_header(&self) -> String {
        format!(
            "{}{}",
            BASIC_SCHEME,
            STANDARD.encode(format!("{}:{}", self.username, self.password))
        )
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn creds() -> Credentials {
        Credentials::new("alice", "s3cret:pw")
    }

    fn basic(raw: &str) -> String {
        format!("Basic {}", STANDARD.encode(raw))
    }

    /// Replace the byte at `idx` with a different ASCII character.
    fn mutate(s: &str, idx: usize) -> String {
        let mut bytes = s.as_bytes().to_vec();
        bytes[idx] = if bytes[idx] == b'x' { b'y' } else { b'x' };
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_exact_pair_accepted() {
        assert!(creds().check(b"alice", b"s3cret:pw"));
        assert!(creds().check_basic(&creds().basic_header()));
        assert!(creds().check_basic(&basic("alice:s3cret:pw")));
    }

    #[test]
    fn test_single_character_mutations_rejected() {
        let c = creds();
        for idx in 0.."alice".len() {
            assert!(!c.check(mutate("alice", idx).as_bytes(), b"s3cret:pw"));
        }
        for idx in 0.."s3cret:pw".len() {
            assert!(!c.check(b"alice", mutate("s3cret:pw", idx).as_bytes()));
        }
        assert!(!c.check(b"Alice", b"s3cret:pw"));
        assert!(!c.check(b"alice", b"s3cret:pw "));
        assert!(!c.check(b"alice", b"s3cret:p"));
    }

    #[rstest]
    #[case::wrong_identity(basic("alice:wrong"))]
    #[case::wrong_user(basic("bob:s3cret:pw"))]
    #[case::missing_separator(basic("alices3cret"))]
    #[case::not_base64("Basic !!!not-base64!!!".to_string())]
    #[case::wrong_scheme(format!("Bearer {}", STANDARD.encode("alice:s3cret:pw")))]
    #[case::lowercase_scheme(format!("basic {}", STANDARD.encode("alice:s3cret:pw")))]
    #[case::no_space(format!("Basic{}", STANDARD.encode("alice:s3cret:pw")))]
    #[case::trailing_space(format!("{} ", basic("alice:s3cret:pw")))]
    #[case::empty(String::new())]
    fn test_malformed_headers_rejected(#[case] header: String) {
        assert!(!creds().check_basic(&header));
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", creds());
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("s3cret"));
    }
}
