//! Users and bearer sessions.
//!
//! Passwords are argon2id hashes. Session tokens are random and only their
//! SHA-256 digest is stored.

use anyhow::Context;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rusqlite::{Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::is_unique_violation;
use crate::error::{DeployError, DeployResult, FieldViolation};
use crate::types::{LoginRequest, LoginResponse, RegisterUserRequest, User};

const MIN_PASSWORD_LEN: usize = 8;

const USER_COLUMNS: &str = "u.id, u.email, u.username, u.full_name, u.created_at, u.last_login_at";

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        username: row.get(2)?,
        full_name: row.get(3)?,
        created_at: row.get(4)?,
        last_login_at: row.get(5)?,
    })
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow::anyhow!("failed to hash password: {}", err))?
        .to_string())
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Digest under which a session token is stored.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn validate_registration(req: &RegisterUserRequest) -> Vec<FieldViolation> {
    let mut violations = Vec::new();
    let email = req.email.trim();
    if email.is_empty() || !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        violations.push(FieldViolation::new("email", "must be a valid email address"));
    }
    let username = req.username.trim();
    if username.len() < 3
        || username.len() > 32
        || !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        violations.push(FieldViolation::new(
            "username",
            "must be 3-32 characters of letters, digits, '-' or '_'",
        ));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        violations.push(FieldViolation::new(
            "password",
            format!("must be at least {} characters", MIN_PASSWORD_LEN),
        ));
    }
    violations
}

pub fn register_user(conn: &Connection, req: &RegisterUserRequest, now: i64) -> DeployResult<User> {
    let violations = validate_registration(req);
    if !violations.is_empty() {
        return Err(DeployError::Validation(violations));
    }

    let user = User {
        id: Uuid::new_v4().to_string(),
        email: req.email.trim().to_lowercase(),
        username: req.username.trim().to_string(),
        full_name: req.full_name.trim().to_string(),
        created_at: now,
        last_login_at: None,
    };
    let password_hash = hash_password(&req.password)?;

    let inserted = conn.execute(
        "INSERT INTO users (id, email, username, full_name, password_hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            user.id,
            user.email,
            user.username,
            user.full_name,
            password_hash,
            now
        ],
    );
    match inserted {
        Ok(_) => Ok(user),
        Err(e) if is_unique_violation(&e) => Err(DeployError::Conflict(
            "email or username already registered".to_string(),
        )),
        Err(e) => Err(anyhow::Error::new(e).context("Failed to insert user").into()),
    }
}

/// Check credentials and open a session valid for `ttl_secs`.
pub fn login(
    conn: &Connection,
    req: &LoginRequest,
    now: i64,
    ttl_secs: i64,
) -> DeployResult<LoginResponse> {
    let email = req.email.trim().to_lowercase();
    let found: Option<(User, String)> = conn
        .query_row(
            &format!(
                "SELECT {}, u.password_hash FROM users u WHERE u.email = ?1",
                USER_COLUMNS
            ),
            rusqlite::params![email],
            |row| Ok((row_to_user(row)?, row.get(6)?)),
        )
        .optional()
        .context("Failed to look up user")?;

    let mut user = match found {
        Some((user, hash)) if verify_password(&req.password, &hash) => user,
        _ => return Err(DeployError::Auth("invalid email or password".to_string())),
    };

    let token = generate_token();
    let expires_at = now + ttl_secs;
    conn.execute(
        "INSERT INTO sessions (token_hash, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![token_digest(&token), user.id, now, expires_at],
    )
    .context("Failed to create session")?;
    conn.execute(
        "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
        rusqlite::params![now, user.id],
    )
    .context("Failed to record login")?;
    user.last_login_at = Some(now);

    Ok(LoginResponse {
        token,
        expires_at,
        user,
    })
}

/// Resolve a bearer token to its user.
pub fn validate_session(conn: &Connection, token: &str, now: i64) -> DeployResult<User> {
    let found: Option<(User, i64)> = conn
        .query_row(
            &format!(
                "SELECT {}, s.expires_at FROM sessions s JOIN users u ON u.id = s.user_id
                 WHERE s.token_hash = ?1",
                USER_COLUMNS
            ),
            rusqlite::params![token_digest(token)],
            |row| Ok((row_to_user(row)?, row.get(6)?)),
        )
        .optional()
        .context("Failed to look up session")?;

    match found {
        Some((user, expires_at)) if expires_at > now => Ok(user),
        Some(_) => {
            conn.execute(
                "DELETE FROM sessions WHERE token_hash = ?1",
                rusqlite::params![token_digest(token)],
            )
            .context("Failed to drop expired session")?;
            Err(DeployError::Auth("session expired".to_string()))
        }
        None => Err(DeployError::Auth("invalid session token".to_string())),
    }
}

pub fn end_session(conn: &Connection, token: &str) -> DeployResult<()> {
    conn.execute(
        "DELETE FROM sessions WHERE token_hash = ?1",
        rusqlite::params![token_digest(token)],
    )
    .context("Failed to end session")?;
    Ok(())
}

pub fn purge_expired_sessions(conn: &Connection, now: i64) -> anyhow::Result<usize> {
    conn.execute(
        "DELETE FROM sessions WHERE expires_at <= ?1",
        rusqlite::params![now],
    )
    .context("Failed to purge expired sessions")
}
