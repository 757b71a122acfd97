//! # Redis
//!
//! The only store. Every domain document is a JSON blob under a typed key,
//! with sets as secondary indexes.
//!
//! ## Schema
//!
//! - `user:{id}` (**JSON**): user document.
//! - `user:email:{email}` (**string**): user id, unique-email guard.
//! - `users` (**set**): all user ids.
//! - `cart:{id}` (**JSON**): cart document. Carries a TTL until `expiresAt`
//!   while the cart is still joinable; the TTL is cleared once the order is
//!   confirmed so history survives.
//! - `carts` (**set**): all cart ids. Pruned lazily when a blob has expired.
//! - `order:cart:{cartId}` (**JSON**): the cart's single order.
//! - `orders` (**set**): cart ids that have an order.
//! - `message:{id}` (**JSON**): chat message document.
//! - `messages:{cartId}` (**set**): the cart's message ids. Chat volume per
//!   cart is small, so ordering is restored from `createdAt` on read.
//! - `review:{id}` (**JSON**): review document.
//! - `reviews:for:{userId}` / `reviews:by:{userId}` (**set**): review ids.
//! - `review:key:{order}:{reviewer}:{reviewee}` (**string**): review id,
//!   written with SET NX as the one-review-per-pair guard.
use std::{collections::HashMap, time::Duration};

use redis::{
    AsyncCommands, Client,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{error::AppError, models::User};

pub async fn init_redis(redis_url: &str) -> ConnectionManager {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url).unwrap();
    let connection_manager = client
        .get_connection_manager_with_config(config)
        .await
        .unwrap();

    connection_manager
}

pub fn user_key(id: &str) -> String {
    format!("user:{id}")
}

pub fn email_key(email: &str) -> String {
    format!("user:email:{email}")
}

pub fn cart_key(id: &str) -> String {
    format!("cart:{id}")
}

pub fn order_key(cart_id: &str) -> String {
    format!("order:cart:{cart_id}")
}

pub fn message_key(id: &str) -> String {
    format!("message:{id}")
}

pub fn messages_key(cart_id: &str) -> String {
    format!("messages:{cart_id}")
}

pub fn review_key(id: &str) -> String {
    format!("review:{id}")
}

pub fn reviews_for_key(user_id: &str) -> String {
    format!("reviews:for:{user_id}")
}

pub fn reviews_by_key(user_id: &str) -> String {
    format!("reviews:by:{user_id}")
}

pub fn review_guard_key(order: &str, reviewer: &str, reviewee: &str) -> String {
    format!("review:key:{order}:{reviewer}:{reviewee}")
}

pub const USERS_INDEX: &str = "users";
pub const CARTS_INDEX: &str = "carts";
pub const ORDERS_INDEX: &str = "orders";

pub async fn get_doc<T: DeserializeOwned>(
    conn: &mut ConnectionManager,
    key: &str,
) -> Result<Option<T>, AppError> {
    let raw: Option<String> = conn.get(key).await?;

    match raw {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub async fn put_doc<T: Serialize>(
    conn: &mut ConnectionManager,
    key: &str,
    doc: &T,
) -> Result<(), AppError> {
    let json = serde_json::to_string(doc)?;
    let _: () = conn.set(key, json).await?;

    Ok(())
}

/// Write a document that should disappear after `ttl_seconds`.
pub async fn put_doc_ex<T: Serialize>(
    conn: &mut ConnectionManager,
    key: &str,
    doc: &T,
    ttl_seconds: u64,
) -> Result<(), AppError> {
    let json = serde_json::to_string(doc)?;
    let _: () = conn.set_ex(key, json, ttl_seconds).await?;

    Ok(())
}

/// Bulk fetch; missing keys come back as `None` in the same positions.
pub async fn mget_docs<T: DeserializeOwned>(
    conn: &mut ConnectionManager,
    keys: &[String],
) -> Result<Vec<Option<T>>, AppError> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<Option<String>> = conn.mget(keys).await?;

    raw.into_iter()
        .map(|entry| match entry {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        })
        .collect()
}

pub async fn fetch_user(
    conn: &mut ConnectionManager,
    user_id: &str,
) -> Result<Option<User>, AppError> {
    get_doc(conn, &user_key(user_id)).await
}

pub async fn require_user(conn: &mut ConnectionManager, user_id: &str) -> Result<User, AppError> {
    fetch_user(conn, user_id)
        .await?
        .ok_or(AppError::NotFound("User"))
}

/// Resolve a batch of user ids to documents, for member lists and reviews.
pub async fn fetch_users(
    conn: &mut ConnectionManager,
    ids: &[String],
) -> Result<HashMap<String, User>, AppError> {
    let keys: Vec<String> = ids.iter().map(|id| user_key(id)).collect();
    let users: Vec<Option<User>> = mget_docs(conn, &keys).await?;

    Ok(users
        .into_iter()
        .flatten()
        .map(|user| (user.id.clone(), user))
        .collect())
}
