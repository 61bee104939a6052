//! Password hashing and strength validation.
//!
//! Hashes are Argon2id in PHC format. Hashing is CPU-bound and runs on
//! the blocking pool through [`PasswordService`]; the pure functions stay
//! synchronous for tests and scripts.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

use ctp_core::config::HashingParams;

const OUTPUT_LEN: usize = 32;

const MIN_LENGTH: usize = 12;
const MAX_LENGTH: usize = 128;
const SPECIAL_CHARACTERS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

const COMMON_PASSWORDS: &[&str] = &[
    "password123",
    "Password123",
    "Password123!",
    "admin123",
    "Admin123",
    "Admin123!",
    "Welcome123",
    "Welcome123!",
    "Qwerty123",
    "Qwerty123!",
    "123456789",
    "12345678",
];

const REJECTED_SEQUENCES: &[&str] = &["12345", "abcde", "qwerty", "asdfg"];

/// Machine-readable strength validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordPolicyError {
    pub code: &'static str,
    pub message: String,
}

impl PasswordPolicyError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PasswordPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PasswordPolicyError {}

/// Validate password strength at set-time.
///
/// Login never validates strength; only setting or changing a password
/// does. Checks run in a fixed order and the first failure wins.
pub fn validate_password_strength(
    password: &str,
    username: Option<&str>,
    email: Option<&str>,
    forbidden_words: &[String],
) -> Result<(), PasswordPolicyError> {
    if password.chars().count() < MIN_LENGTH {
        return Err(PasswordPolicyError::new(
            "PASSWORD_TOO_SHORT",
            format!("Password must be at least {MIN_LENGTH} characters long"),
        ));
    }
    if password.chars().count() > MAX_LENGTH {
        return Err(PasswordPolicyError::new(
            "PASSWORD_TOO_LONG",
            format!("Password must not exceed {MAX_LENGTH} characters"),
        ));
    }

    let mut missing = Vec::new();
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        missing.push("at least one uppercase letter (A-Z)");
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        missing.push("at least one lowercase letter (a-z)");
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        missing.push("at least one digit (0-9)");
    }
    if !password.chars().any(|c| SPECIAL_CHARACTERS.contains(c)) {
        missing.push("at least one special character");
    }
    if !missing.is_empty() {
        return Err(PasswordPolicyError::new(
            "PASSWORD_COMPLEXITY_FAILED",
            format!("Password must contain: {}", missing.join(", ")),
        ));
    }

    if COMMON_PASSWORDS.contains(&password) {
        return Err(PasswordPolicyError::new(
            "PASSWORD_TOO_COMMON",
            "This password is too common. Please choose a more unique password.",
        ));
    }

    let lowered = password.to_lowercase();
    for sequence in REJECTED_SEQUENCES {
        if lowered.contains(sequence) {
            return Err(PasswordPolicyError::new(
                "PASSWORD_CONTAINS_SEQUENCE",
                "Password contains a common sequence. Please choose a more complex password.",
            ));
        }
    }

    if let Some(username) = username {
        if username.len() >= 3 && lowered.contains(&username.to_lowercase()) {
            return Err(PasswordPolicyError::new(
                "PASSWORD_CONTAINS_USERNAME",
                "Password must not contain your username",
            ));
        }
    }

    if let Some(email) = email {
        let local = email.split('@').next().unwrap_or_default().to_lowercase();
        if local.len() >= 3 && lowered.contains(&local) {
            return Err(PasswordPolicyError::new(
                "PASSWORD_CONTAINS_EMAIL",
                "Password must not contain parts of your email address",
            ));
        }
    }

    for word in forbidden_words {
        if !word.is_empty() && lowered.contains(&word.to_lowercase()) {
            return Err(PasswordPolicyError::new(
                "PASSWORD_CONTAINS_FORBIDDEN_WORD",
                "Password contains a forbidden word",
            ));
        }
    }

    let distinct: std::collections::HashSet<char> = password.chars().collect();
    if distinct.len() <= 2 {
        return Err(PasswordPolicyError::new(
            "PASSWORD_TOO_REPETITIVE",
            "Password must contain more variety of characters",
        ));
    }

    Ok(())
}

fn hasher(params: HashingParams) -> Argon2<'static> {
    let params = Params::new(
        params.memory_kib,
        params.time_cost,
        params.parallelism,
        Some(OUTPUT_LEN),
    )
    .unwrap_or_else(|_| Params::default());
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str, params: HashingParams) -> String {
    let salt = SaltString::generate(&mut OsRng);
    hasher(params)
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .unwrap_or_default()
}

/// Constant-time verification. Non-Argon2 stored values (legacy
/// encrypted credentials) always fail, forcing a reset.
pub fn verify_password(password: &str, stored: &str, params: HashingParams) -> bool {
    if !is_argon2_hash(stored) {
        return false;
    }
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    hasher(params)
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Whether the stored hash was produced with different parameters than
/// the current configuration and should be upgraded on next login.
pub fn needs_rehash(stored: &str, current: HashingParams) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return true;
    };
    match Params::try_from(&parsed) {
        Ok(stored_params) => {
            stored_params.m_cost() != current.memory_kib
                || stored_params.t_cost() != current.time_cost
                || stored_params.p_cost() != current.parallelism
        }
        Err(_) => true,
    }
}

pub fn is_argon2_hash(value: &str) -> bool {
    value.starts_with("$argon2")
}

/// Async facade that keeps Argon2 work off the async scheduler.
#[derive(Clone, Copy, Debug)]
pub struct PasswordService {
    params: HashingParams,
}

impl PasswordService {
    pub fn new(params: HashingParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> HashingParams {
        self.params
    }

    pub async fn hash(&self, password: &str) -> String {
        let password = password.to_string();
        let params = self.params;
        tokio::task::spawn_blocking(move || hash_password(&password, params))
            .await
            .unwrap_or_default()
    }

    pub async fn verify(&self, password: &str, stored: &str) -> bool {
        let password = password.to_string();
        let stored = stored.to_string();
        let params = self.params;
        tokio::task::spawn_blocking(move || verify_password(&password, &stored, params))
            .await
            .unwrap_or(false)
    }

    pub fn needs_rehash(&self, stored: &str) -> bool {
        needs_rehash(stored, self.params)
    }
}
