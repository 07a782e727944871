//! Account registration and credential verification
//!
//! The server only reacts to the outcome of [`Authenticator::verify`]; how
//! credentials are stored is up to the implementation. [`CredentialStore`]
//! keeps salted PBKDF2-HMAC-SHA256 hashes in memory, so accounts last as
//! long as the process.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::RwLock;

use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

// ============================================================================
// Constants
// ============================================================================

/// PBKDF2 rounds for stored passwords
pub const DEFAULT_ITERATIONS: u32 = 100_000;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = ring::digest::SHA256_OUTPUT_LEN;

/// Longest accepted username
pub const MAX_USERNAME_LEN: usize = 32;

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

// ============================================================================
// Types
// ============================================================================

/// Authentication collaborator
pub trait Authenticator: Send + Sync {
    /// Create an account
    fn register(&self, username: &str, password: &str) -> Result<(), AuthError>;

    /// Check a username/password pair
    fn verify(&self, username: &str, password: &str) -> Result<(), AuthError>;
}

/// Errors from registration and verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Username empty, too long, or containing unsupported characters
    InvalidUsername(String),
    EmptyPassword,
    UsernameTaken(String),
    /// Unknown user or wrong password (deliberately indistinguishable)
    BadCredentials,
    /// Salt generation or store access failed
    Internal(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::InvalidUsername(name) => write!(f, "invalid username '{}'", name),
            AuthError::EmptyPassword => write!(f, "password must not be empty"),
            AuthError::UsernameTaken(name) => write!(f, "username '{}' is taken", name),
            AuthError::BadCredentials => write!(f, "invalid username or password"),
            AuthError::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

impl std::error::Error for AuthError {}

/// Usernames are 1-32 ASCII letters, digits, `_`, `-` or `.`
pub fn validate_username(username: &str) -> Result<(), AuthError> {
    let valid = !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(AuthError::InvalidUsername(username.to_string()))
    }
}

// ============================================================================
// Credential Store
// ============================================================================

#[derive(Clone, Copy)]
struct StoredCredential {
    salt: [u8; SALT_LEN],
    hash: [u8; HASH_LEN],
}

/// In-memory salted password store
pub struct CredentialStore {
    accounts: RwLock<HashMap<String, StoredCredential>>,
    iterations: NonZeroU32,
    rng: SystemRandom,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::with_iterations(DEFAULT_ITERATIONS)
    }

    /// Store with a custom PBKDF2 round count (at least 1)
    pub fn with_iterations(iterations: u32) -> Self {
        CredentialStore {
            accounts: RwLock::new(HashMap::new()),
            iterations: NonZeroU32::new(iterations).unwrap_or(NonZeroU32::MIN),
            rng: SystemRandom::new(),
        }
    }

    /// Number of registered accounts
    pub fn len(&self) -> usize {
        self.accounts.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for CredentialStore {
    fn register(&self, username: &str, password: &str) -> Result<(), AuthError> {
        validate_username(username)?;
        if password.is_empty() {
            return Err(AuthError::EmptyPassword);
        }

        let mut salt = [0u8; SALT_LEN];
        self.rng
            .fill(&mut salt)
            .map_err(|_| AuthError::Internal("salt generation failed".to_string()))?;
        let mut hash = [0u8; HASH_LEN];
        pbkdf2::derive(PBKDF2_ALG, self.iterations, &salt, password.as_bytes(), &mut hash);

        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| AuthError::Internal("credential store poisoned".to_string()))?;
        if accounts.contains_key(username) {
            return Err(AuthError::UsernameTaken(username.to_string()));
        }
        accounts.insert(username.to_string(), StoredCredential { salt, hash });
        log::info!("Registered account '{}'", username);
        Ok(())
    }

    fn verify(&self, username: &str, password: &str) -> Result<(), AuthError> {
        // Hash outside the lock so registrations are not held up
        let stored = self
            .accounts
            .read()
            .map_err(|_| AuthError::Internal("credential store poisoned".to_string()))?
            .get(username)
            .copied()
            .ok_or(AuthError::BadCredentials)?;
        pbkdf2::verify(
            PBKDF2_ALG,
            self.iterations,
            &stored.salt,
            password.as_bytes(),
            &stored.hash,
        )
        .map_err(|_| AuthError::BadCredentials)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
