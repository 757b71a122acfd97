//! In-cart chat over REST, with the realtime layer fanning new/edited/deleted
//! messages out to connected members.
use std::{collections::HashMap, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use redis::{AsyncCommands, aio::ConnectionManager};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    carts::load_cart,
    database::{fetch_users, get_doc, message_key, messages_key, mget_docs, put_doc},
    error::AppError,
    models::{Cart, Message, MessageLocation, MessageType, ReadReceipt, User},
    state::AppState,
    ws::{ServerEvent, cart_room},
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(send_message))
        .route("/unread/{cart_id}", get(unread_count))
        // GET takes a cart id, PUT/DELETE a message id, as the original API did
        .route(
            "/{id}",
            get(get_messages).put(edit_message).delete(delete_message),
        )
}

fn require_member(cart: &Cart, user_id: &str) -> Result<(), AppError> {
    if !cart.is_member(user_id) {
        return Err(AppError::Forbidden(
            "You are not a member of this cart".to_string(),
        ));
    }

    Ok(())
}

async fn load_cart_messages(
    conn: &mut ConnectionManager,
    cart_id: &str,
) -> Result<Vec<Message>, AppError> {
    let ids: Vec<String> = conn.smembers(messages_key(cart_id)).await?;
    let keys: Vec<String> = ids.iter().map(|id| message_key(id)).collect();

    let mut messages: Vec<Message> = mget_docs(conn, &keys).await?.into_iter().flatten().collect();
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    Ok(messages)
}

fn count_unread(messages: &[Message], user_id: &str) -> usize {
    messages
        .iter()
        .filter(|m| !m.is_deleted && !m.read_by_user(user_id))
        .count()
}

fn message_view(message: &Message, users: &HashMap<String, User>) -> Result<Value, AppError> {
    let mut value = serde_json::to_value(message)?;
    if let Some(sender) = users.get(&message.sender) {
        value["sender"] = serde_json::to_value(sender.summary())?;
    }

    Ok(value)
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    page: Option<usize>,
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(cart_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let cart = load_cart(&mut conn, &cart_id).await?;
    require_member(&cart, &user.id)?;

    let limit = query.limit.unwrap_or(50).max(1);
    let page = query.page.unwrap_or(1).max(1);

    let mut messages = load_cart_messages(&mut conn, &cart_id).await?;

    // Everything unread becomes read on fetch, not just the current page
    for message in &mut messages {
        if !message.read_by_user(&user.id) {
            message.read_by.push(ReadReceipt {
                user: user.id.clone(),
                read_at: Utc::now(),
            });
            put_doc(&mut conn, &message_key(&message.id), message).await?;
        }
    }

    let visible: Vec<&Message> = messages.iter().filter(|m| !m.is_deleted).collect();

    // Page from the newest end, then hand back chronological order
    let newest_first: Vec<&Message> = visible.into_iter().rev().collect();
    let mut page_messages: Vec<&Message> = newest_first
        .into_iter()
        .skip((page - 1) * limit)
        .take(limit)
        .collect();
    page_messages.reverse();

    let sender_ids: Vec<String> = page_messages.iter().map(|m| m.sender.clone()).collect();
    let users = fetch_users(&mut conn, &sender_ids).await?;

    let views: Vec<Value> = page_messages
        .iter()
        .map(|m| message_view(m, &users))
        .collect::<Result<_, _>>()?;

    Ok(Json(json!({
        "success": true,
        "count": views.len(),
        "data": views,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    cart_id: String,
    content: Option<String>,
    message_type: Option<MessageType>,
    image_url: Option<String>,
    location: Option<MessageLocation>,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(payload): Json<SendRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let cart = load_cart(&mut conn, &payload.cart_id).await?;
    require_member(&cart, &user.id)?;

    if !cart.chat_enabled {
        return Err(AppError::Conflict(
            "Chat is disabled for this cart".to_string(),
        ));
    }

    let message_type = payload.message_type.unwrap_or(MessageType::Text);

    if matches!(message_type, MessageType::Text | MessageType::System) {
        match &payload.content {
            Some(content) if !content.is_empty() && content.len() <= 1000 => {}
            _ => {
                return Err(AppError::Validation(
                    "Message content is required and cannot be more than 1000 characters"
                        .to_string(),
                ));
            }
        }
    }

    let message = Message {
        id: Uuid::new_v4().to_string(),
        cart: cart.id.clone(),
        sender: user.id.clone(),
        message_type,
        content: payload.content,
        image_url: payload.image_url,
        location: payload.location,
        read_by: vec![ReadReceipt {
            user: user.id.clone(),
            read_at: Utc::now(),
        }],
        is_edited: false,
        edited_at: None,
        is_deleted: false,
        created_at: Utc::now(),
    };

    put_doc(&mut conn, &message_key(&message.id), &message).await?;
    let _: () = conn.sadd(messages_key(&cart.id), &message.id).await?;

    let users = fetch_users(&mut conn, std::slice::from_ref(&user.id)).await?;
    let view = message_view(&message, &users)?;

    state.rooms.publish(
        &cart_room(&cart.id),
        &ServerEvent::MessageNew {
            message: view.clone(),
        },
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": view })),
    ))
}

#[derive(Deserialize)]
struct EditRequest {
    content: String,
}

async fn edit_message(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(payload): Json<EditRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let mut message: Message = get_doc(&mut conn, &message_key(&id))
        .await?
        .ok_or(AppError::NotFound("Message"))?;

    if message.sender != user.id {
        return Err(AppError::Forbidden(
            "Not authorized to edit this message".to_string(),
        ));
    }

    message.content = Some(payload.content);
    message.is_edited = true;
    message.edited_at = Some(Utc::now());
    put_doc(&mut conn, &message_key(&id), &message).await?;

    let users = fetch_users(&mut conn, std::slice::from_ref(&user.id)).await?;
    let view = message_view(&message, &users)?;

    state.rooms.publish(
        &cart_room(&message.cart),
        &ServerEvent::MessageEdited {
            message: view.clone(),
        },
    );

    Ok(Json(json!({ "success": true, "data": view })))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let mut message: Message = get_doc(&mut conn, &message_key(&id))
        .await?
        .ok_or(AppError::NotFound("Message"))?;

    if message.sender != user.id {
        return Err(AppError::Forbidden(
            "Not authorized to delete this message".to_string(),
        ));
    }

    message.is_deleted = true;
    put_doc(&mut conn, &message_key(&id), &message).await?;

    state.rooms.publish(
        &cart_room(&message.cart),
        &ServerEvent::MessageDeleted {
            message_id: message.id.clone(),
        },
    );

    Ok(Json(json!({ "success": true, "data": {} })))
}

async fn unread_count(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(cart_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let messages = load_cart_messages(&mut conn, &cart_id).await?;

    Ok(Json(json!({
        "success": true,
        "count": count_unread(&messages, &user.id),
    })))
}

#[cfg(test)]
mod tests {
    use super::count_unread;
    use crate::models::{Message, MessageType, ReadReceipt};
    use chrono::Utc;

    fn message(sender: &str, read_by: &[&str], deleted: bool) -> Message {
        Message {
            id: "m".to_string(),
            cart: "c".to_string(),
            sender: sender.to_string(),
            message_type: MessageType::Text,
            content: Some("hi".to_string()),
            image_url: None,
            location: None,
            read_by: read_by
                .iter()
                .map(|u| ReadReceipt {
                    user: u.to_string(),
                    read_at: Utc::now(),
                })
                .collect(),
            is_edited: false,
            edited_at: None,
            is_deleted: deleted,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_unread_counting() {
        let messages = vec![
            message("u1", &["u1"], false),
            message("u1", &["u1", "u2"], false),
            message("u2", &["u2"], false),
        ];

        assert_eq!(count_unread(&messages, "u2"), 1);
        assert_eq!(count_unread(&messages, "u1"), 1);
        assert_eq!(count_unread(&messages, "u3"), 3);
    }

    #[test]
    fn test_deleted_messages_not_counted() {
        let messages = vec![message("u1", &["u1"], true)];

        assert_eq!(count_unread(&messages, "u2"), 0);
    }
}
