#![cfg(not(tarpaulin_include))]

#[cfg(feature = "web")]
use crate::app::AppState;
use crate::error::{AppError, Result};
use crate::models::{SessionUser, User, format_timestamp};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
#[cfg(feature = "web")]
use axum::{
    Extension, Form, Json,
    extract::{FromRequest, Query, Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
#[cfg(feature = "web")]
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::NaiveDateTime;
use serde::Deserialize;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use uuid::Uuid;

/// Name of the cookie carrying the session id.
pub const SESSION_COOKIE: &str = "session";

/// Credential data for login
///
/// Used to receive the login form from the client.
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,

    /// Password in plaintext (only transmitted, never stored)
    #[serde(default)]
    pub password: String,
}

/// Hash a password using Argon2
///
/// # Arguments
/// * `password` - The plaintext password to hash
///
/// # Returns
/// * `Result<String>` - The PHC-formatted hash
///
/// # Errors
/// * Returns an error if the password hashing fails
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Password(e.to_string()))
}

/// Verify a password against a stored hash
///
/// # Arguments
/// * `password` - The plaintext password to verify
/// * `hash` - The stored password hash to check against
///
/// # Returns
/// * `bool` - True if the password matches; false if it does not or the stored
///   hash is not a valid PHC string
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// Check a username/password pair against the users table.
///
/// Inactive accounts never authenticate. On success `last_login` is stamped
/// with `now`.
///
/// # Errors
/// * `Validation` when either field is blank
/// * `Database` on query failure
pub async fn authenticate(
    conn: &mut SqliteConnection,
    username: &str,
    password: &str,
    now: NaiveDateTime,
) -> Result<Option<User>> {
    let username = username.trim();
    let password = password.trim();
    if username.is_empty() || password.is_empty() {
        return Err(AppError::validation(
            "Please provide both username and password",
        ));
    }

    let Some(user) = crate::users::find_by_username(conn, username).await? else {
        return Ok(None);
    };
    if !user.is_active || !verify_password(password, &user.password) {
        return Ok(None);
    }

    sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
        .bind(format_timestamp(now))
        .bind(user.id)
        .execute(&mut *conn)
        .await?;

    Ok(Some(user))
}

/// User session data
#[derive(Debug, Clone)]
pub struct Session {
    pub user: SessionUser,

    /// Time when the session expires
    pub expires_at: SystemTime,
}

/// In-memory session storage shared by all request handlers.
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    lifetime: Duration,
}

impl SessionStore {
    pub fn new(lifetime: Duration) -> Self {
        SessionStore {
            sessions: RwLock::new(HashMap::new()),
            lifetime,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Session>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Session>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a new session and return its id.
    pub fn create(&self, user: SessionUser) -> String {
        let session_id = Uuid::new_v4().to_string();
        let session = Session {
            user,
            expires_at: SystemTime::now() + self.lifetime,
        };
        self.write().insert(session_id.clone(), session);
        session_id
    }

    /// Look up a session. Expired sessions are dropped and yield `None`.
    pub fn get(&self, session_id: &str) -> Option<SessionUser> {
        let expired = match self.read().get(session_id) {
            Some(session) if session.expires_at > SystemTime::now() => {
                return Some(session.user.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.remove(session_id);
        }
        None
    }

    pub fn remove(&self, session_id: &str) {
        self.write().remove(session_id);
    }

    /// End every session belonging to `user_id`.
    pub fn remove_user(&self, user_id: i64) {
        self.write().retain(|_, session| session.user.user_id != user_id);
    }

    /// Drop expired sessions and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut sessions = self.write();
        let before = sessions.len();
        sessions.retain(|_, session| session.expires_at > now);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Web handler functions below (only compiled with "web" feature)

/// Where `/login` sends the user after signing in.
#[derive(Debug, Default, Deserialize)]
pub struct LoginQuery {
    pub next: Option<String>,
}

/// Answer `GET /login`, the target of unauthenticated browser redirects.
#[cfg(feature = "web")]
pub async fn login_prompt(Query(query): Query<LoginQuery>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Please log in to access this page",
        "next": query.next.unwrap_or_else(|| "/".to_string()),
    }))
}

/// Read the credentials from either a JSON or a urlencoded form body.
#[cfg(feature = "web")]
async fn read_credentials(request: Request) -> Result<LoginForm> {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));

    if is_json {
        let Json(form) = Json::<LoginForm>::from_request(request, &())
            .await
            .map_err(|e| AppError::validation(e.body_text()))?;
        Ok(form)
    } else {
        let Form(form) = Form::<LoginForm>::from_request(request, &())
            .await
            .map_err(|e| AppError::validation(e.body_text()))?;
        Ok(form)
    }
}

/// Handle user login requests
///
/// Validates the submitted credentials (form or JSON body), creates a session
/// and sets the session cookie before redirecting to the dashboard.
///
/// # Returns
/// * `Result<(CookieJar, Redirect)>` - Redirect to `/` with the cookie set, or
///   400 for missing fields and 401 for bad credentials
#[cfg(feature = "web")]
pub async fn handle_login(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
) -> Result<(CookieJar, Redirect)> {
    let credentials = read_credentials(request).await?;
    let mut conn = state.pool.acquire().await?;
    let now = crate::models::now();
    let Some(user) =
        authenticate(&mut conn, &credentials.username, &credentials.password, now).await?
    else {
        warn!(username = %credentials.username.trim(), "failed login");
        return Err(AppError::InvalidCredentials);
    };

    let session_id = state.sessions.create(SessionUser::from(&user));
    info!(username = %user.username, role = %user.role, "user logged in");

    let cookie = Cookie::build((SESSION_COOKIE, session_id))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax);
    Ok((jar.add(cookie), Redirect::to("/")))
}

/// Handle user logout
///
/// Ends the server-side session, clears the cookie and redirects to the login
/// page.
#[cfg(feature = "web")]
pub async fn handle_logout(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Redirect) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.sessions.remove(cookie.value());
    }
    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
    (jar, Redirect::to("/login"))
}

/// The user behind the current session.
#[cfg(feature = "web")]
pub async fn current_user(Extension(user): Extension<SessionUser>) -> Json<SessionUser> {
    Json(user)
}

/// Authentication middleware
///
/// A valid session cookie puts the [`SessionUser`] into the request
/// extensions. Otherwise browsers asking for HTML are redirected to `/login`
/// and every other client gets a 401 JSON error.
#[cfg(feature = "web")]
pub async fn require_auth(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(user) = jar
        .get(SESSION_COOKIE)
        .and_then(|cookie| state.sessions.get(cookie.value()))
    {
        request.extensions_mut().insert(user);
        return next.run(request).await;
    }

    let wants_html = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"));
    if wants_html {
        let target = format!(
            "/login?next={}",
            urlencoding::encode(request.uri().path())
        );
        Redirect::to(&target).into_response()
    } else {
        AppError::Unauthorized.into_response()
    }
}

/// Admin guard, layered inside [`require_auth`].
#[cfg(feature = "web")]
pub async fn require_admin(request: Request, next: Next) -> Response {
    match request.extensions().get::<SessionUser>() {
        Some(user) if user.is_admin() => next.run(request).await,
        Some(_) => AppError::Forbidden("Admin access required".into()).into_response(),
        None => AppError::Unauthorized.into_response(),
    }
}
