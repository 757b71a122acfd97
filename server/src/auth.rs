//! Bearer-token auth: bcrypt credentials, JWT sessions, and the extractor
//! every protected route hangs off.
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, State},
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    response::IntoResponse,
    routing::{get, post, put},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{
    database::{USERS_INDEX, email_key, fetch_user, put_doc, user_key},
    error::AppError,
    models::{Location, User},
    state::AppState,
};
use redis::AsyncCommands;

const BCRYPT_COST: u32 = 8;

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

pub fn sign_token(state: &AppState, user_id: &str) -> Result<String, AppError> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (Utc::now() + Duration::hours(state.config.token_ttl_hours)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(state.config.jwt_secret.as_bytes()),
    )
    .map_err(AppError::internal)
}

/// Token to live user document. Shared by the HTTP extractor and the
/// websocket handshake.
pub async fn authenticate(state: &AppState, token: &str) -> Result<User, AppError> {
    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::InvalidToken)?
    .claims;

    let mut conn = state.redis.clone();
    fetch_user(&mut conn, &claims.sub)
        .await?
        .ok_or(AppError::InvalidToken)
}

pub struct AuthUser(pub User);

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(AppError::MissingToken)?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or(AppError::MissingToken)?;

        Ok(AuthUser(authenticate(state, token).await?))
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/me", get(me))
        .route("/location", put(update_location))
}

#[derive(Deserialize)]
struct RegisterRequest {
    name: String,
    email: String,
    password: String,
    phone: Option<String>,
    location: Option<Location>,
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let name = payload.name.trim();
    if name.is_empty() || name.len() > 50 {
        return Err(AppError::Validation(
            "Name cannot be more than 50 characters".to_string(),
        ));
    }

    let email = payload.email.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(AppError::Validation(
            "Please provide a valid email".to_string(),
        ));
    }

    if payload.password.len() < 6 {
        return Err(AppError::Validation(
            "Password must be at least 6 characters".to_string(),
        ));
    }

    if let Some(phone) = &payload.phone {
        if !is_valid_phone(phone) {
            return Err(AppError::Validation(
                "Please provide a valid Indian phone number".to_string(),
            ));
        }
    }

    let hash = bcrypt::hash(&payload.password, BCRYPT_COST).map_err(AppError::internal)?;

    let mut user = User::new(name.to_string(), email.clone(), hash);
    if let Some(phone) = payload.phone {
        user.phone = phone;
    }
    if let Some(location) = payload.location {
        user.location = location;
    }

    let mut conn = state.redis.clone();

    // SET NX on the email key doubles as the uniqueness check
    let claimed: bool = conn.set_nx(email_key(&email), &user.id).await?;
    if !claimed {
        return Err(AppError::Conflict("Email already registered".to_string()));
    }

    put_doc(&mut conn, &user_key(&user.id), &user).await?;
    let _: () = conn.sadd(USERS_INDEX, &user.id).await?;

    info!("Registered user {}", user.id);

    let token = sign_token(&state, &user.id)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "token": token,
            "data": user.without_password()?,
        })),
    ))
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let email = payload.email.trim().to_lowercase();
    let mut conn = state.redis.clone();

    let user_id: Option<String> = conn.get(email_key(&email)).await?;
    let user_id = user_id.ok_or(AppError::InvalidCredentials)?;

    let mut user = fetch_user(&mut conn, &user_id)
        .await?
        .ok_or(AppError::InvalidCredentials)?;

    let matches =
        bcrypt::verify(&payload.password, &user.password).map_err(AppError::internal)?;
    if !matches {
        return Err(AppError::InvalidCredentials);
    }

    user.last_seen = Utc::now();
    put_doc(&mut conn, &user_key(&user.id), &user).await?;

    let token = sign_token(&state, &user.id)?;

    Ok(Json(json!({
        "success": true,
        "token": token,
        "data": user.without_password()?,
    })))
}

async fn me(AuthUser(user): AuthUser) -> Result<impl IntoResponse, AppError> {
    Ok(Json(json!({
        "success": true,
        "data": user.without_password()?,
    })))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    AuthUser(mut user): AuthUser,
    Json(location): Json<Location>,
) -> Result<impl IntoResponse, AppError> {
    user.location = location;

    let mut conn = state.redis.clone();
    put_doc(&mut conn, &user_key(&user.id), &user).await?;

    Ok(Json(json!({
        "success": true,
        "data": user.without_password()?,
    })))
}

fn is_valid_email(email: &str) -> bool {
    let re = Regex::new(r"^\w+([\.-]?\w+)*@\w+([\.-]?\w+)*(\.\w{2,3})+$").unwrap();

    re.is_match(email)
}

fn is_valid_phone(phone: &str) -> bool {
    let re = Regex::new(r"^[6-9]\d{9}$").unwrap();

    re.is_match(phone)
}

#[cfg(test)]
mod tests {
    use super::{is_valid_email, is_valid_phone};

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("asha@example.com"));
        assert!(is_valid_email("a.b-c@mail.co.in"));
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("missing@domain"));
    }

    #[test]
    fn test_phone_validation() {
        assert!(is_valid_phone("9876543210"));
        assert!(is_valid_phone("6000000000"));
        assert!(!is_valid_phone("1234567890"));
        assert!(!is_valid_phone("98765"));
        assert!(!is_valid_phone("98765432101"));
    }
}
