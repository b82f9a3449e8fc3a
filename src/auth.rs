use anyhow::anyhow;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

const MIN_USERNAME_LEN: usize = 3;
const MAX_USERNAME_LEN: usize = 80;
const MIN_PASSWORD_LEN: usize = 6;

lazy_static! {
    static ref EMAIL: Regex =
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").unwrap();
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    InvalidRegistration(String),

    #[error("{0} is already registered")]
    Conflict(&'static str),

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Authentication required")]
    Unauthorized,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// The body of a registration request
#[derive(Debug, Deserialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl Registration {
    /// Check the fields and normalize them, trimming the username and lowercasing the email
    pub fn validate(self) -> Result<Self, AuthError> {
        let username = self.username.trim().to_owned();
        let email = self.email.trim().to_lowercase();

        let username_len = username.chars().count();
        if username_len < MIN_USERNAME_LEN || username_len > MAX_USERNAME_LEN {
            return Err(AuthError::InvalidRegistration(format!(
                "Username must be between {MIN_USERNAME_LEN} and {MAX_USERNAME_LEN} characters"
            )));
        }
        // Logins by email are told apart from logins by username by the @
        if username.contains('@') {
            return Err(AuthError::InvalidRegistration(String::from(
                "Username cannot contain @",
            )));
        }
        if !EMAIL.is_match(&email) {
            return Err(AuthError::InvalidRegistration(String::from(
                "Invalid email address",
            )));
        }
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::InvalidRegistration(format!(
                "Password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        Ok(Self {
            username,
            email,
            password: self.password,
        })
    }
}

/// The body of a login request, where `login` is either a username or an email
#[derive(Debug, Deserialize)]
pub struct Credentials {
    #[serde(alias = "username", alias = "email")]
    pub login: String,
    pub password: String,
}

/// Hashes and verifies passwords with argon2id, keyed with the server's secret
#[derive(Clone)]
pub struct Passwords {
    secret: Vec<u8>,
    params: Params,
}

impl Passwords {
    pub fn new(secret: &str) -> Self {
        Self::with_params(secret, Params::default())
    }

    pub fn with_params(secret: &str, params: Params) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            params,
        }
    }

    fn argon2(&self) -> anyhow::Result<Argon2<'_>> {
        Argon2::new_with_secret(
            &self.secret,
            Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        )
        .map_err(|err| anyhow!("Failed to initialize argon2: {err}"))
    }

    /// Hash a password into a PHC string
    pub fn hash(&self, password: &str) -> anyhow::Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        Ok(self
            .argon2()?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| anyhow!("Failed to hash password: {err}"))?
            .to_string())
    }

    /// Do the same amount of work as `verify` for a login that matched no user, so the response time doesn't
    /// reveal which usernames exist
    pub fn verify_unknown(&self, password: &str) -> anyhow::Result<bool> {
        self.hash(password)?;
        Ok(false)
    }

    /// Determine whether the password matches a PHC string produced by `hash`
    pub fn verify(&self, password: &str, hash: &str) -> anyhow::Result<bool> {
        let hash =
            PasswordHash::new(hash).map_err(|err| anyhow!("Invalid password hash: {err}"))?;
        Ok(self
            .argon2()?
            .verify_password(password.as_bytes(), &hash)
            .is_ok())
    }
}

/// Generate a new random session token
pub fn new_token() -> String {
    Uuid::new_v4().to_string()
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[cfg(test)]
pub(crate) fn test_passwords() -> Passwords {
    // Keep hashing fast in tests
    Passwords::with_params("test-secret", Params::new(1024, 1, 1, None).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn registration(username: &str, email: &str, password: &str) -> Registration {
        Registration {
            username: username.to_owned(),
            email: email.to_owned(),
            password: password.to_owned(),
        }
    }

    #[test]
    fn test_validate() {
        let valid = registration(" alice ", "Alice@Example.COM", "hunter22")
            .validate()
            .unwrap();
        assert_eq!(valid.username, "alice");
        assert_eq!(valid.email, "alice@example.com");

        assert_matches!(
            registration("al", "alice@example.com", "hunter22").validate(),
            Err(AuthError::InvalidRegistration(_))
        );
        assert_matches!(
            registration("al@ice", "alice@example.com", "hunter22").validate(),
            Err(AuthError::InvalidRegistration(_))
        );
        assert_matches!(
            registration("alice", "not-an-email", "hunter22").validate(),
            Err(AuthError::InvalidRegistration(message)) if message == "Invalid email address"
        );
        assert_matches!(
            registration("alice", "alice@example.com", "12345").validate(),
            Err(AuthError::InvalidRegistration(_))
        );
    }

    #[test]
    fn test_hash_and_verify() {
        let passwords = test_passwords();
        let hash = passwords.hash("hunter22").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(passwords.verify("hunter22", &hash).unwrap());
        assert!(!passwords.verify("hunter23", &hash).unwrap());

        // Salts are random
        assert_ne!(hash, passwords.hash("hunter22").unwrap());
    }

    #[test]
    fn test_secret_is_required_to_verify() {
        let hash = test_passwords().hash("hunter22").unwrap();
        let other = Passwords::with_params("other-secret", Params::new(1024, 1, 1, None).unwrap());
        assert!(!other.verify("hunter22", &hash).unwrap());
    }

    #[test]
    fn test_verify_unknown() {
        assert!(!test_passwords().verify_unknown("hunter22").unwrap());
    }

    #[test]
    fn test_invalid_hash() {
        assert!(test_passwords().verify("hunter22", "plaintext").is_err());
    }

    #[test]
    fn test_credentials_aliases() {
        let credentials: Credentials =
            serde_json::from_str(r#"{"username": "alice", "password": "hunter22"}"#).unwrap();
        assert_eq!(credentials.login, "alice");
        let credentials: Credentials =
            serde_json::from_str(r#"{"email": "alice@example.com", "password": "hunter22"}"#)
                .unwrap();
        assert_eq!(credentials.login, "alice@example.com");
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc-123"), Some("abc-123"));
        assert_eq!(bearer_token("bearer  abc-123 "), Some("abc-123"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("abc"), None);
    }
}
