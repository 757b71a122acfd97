//! Cart browsing and the membership lifecycle: create, join, leave, update,
//! delete. Join and leave are the two operations that move split amounts.
use std::{collections::HashMap, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, aio::ConnectionManager};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    auth::AuthUser,
    database::{CARTS_INDEX, cart_key, fetch_users, get_doc, put_doc, put_doc_ex},
    error::AppError,
    geo,
    models::{
        Cart, CartStatus, DEFAULT_AVATAR, Location, MemberStatus, Platform, PublicUser, User,
    },
    state::AppState,
    ws::{GLOBAL_ROOM, ServerEvent, cart_room},
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_carts).post(create_cart))
        .route("/my/all", get(my_carts))
        .route(
            "/{id}",
            get(get_cart).put(update_cart).delete(delete_cart),
        )
        .route("/{id}/join", post(join_cart))
        .route("/{id}/leave", post(leave_cart))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberView {
    pub user: PublicUser,
    pub joined_at: DateTime<Utc>,
    pub status: MemberStatus,
    pub split_amount: u32,
}

/// A cart with its user references resolved, as the API returns it.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    pub id: String,
    pub creator: PublicUser,
    pub platform: Platform,
    pub location: Location,
    pub delivery_charge: u32,
    pub max_members: u32,
    pub members: Vec<MemberView>,
    pub status: CartStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub is_public: bool,
    pub max_distance: f64,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_time: Option<DateTime<Utc>>,
    pub chat_enabled: bool,
    pub total_orders: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
}

fn resolve(users: &HashMap<String, User>, id: &str, contact: bool) -> PublicUser {
    match users.get(id) {
        Some(user) if contact => user.contact_card(),
        Some(user) => user.summary(),
        // Referenced user no longer exists; keep the reference renderable
        None => PublicUser {
            id: id.to_string(),
            name: "Unknown".to_string(),
            avatar: DEFAULT_AVATAR.to_string(),
            rating: 5.0,
            phone: None,
            email: None,
        },
    }
}

fn build_view(
    cart: &Cart,
    users: &HashMap<String, User>,
    distance: Option<f64>,
    contact: bool,
) -> CartView {
    CartView {
        id: cart.id.clone(),
        creator: resolve(users, &cart.creator, contact),
        platform: cart.platform,
        location: cart.location.clone(),
        delivery_charge: cart.delivery_charge,
        max_members: cart.max_members,
        members: cart
            .members
            .iter()
            .map(|m| MemberView {
                user: resolve(users, &m.user, false),
                joined_at: m.joined_at,
                status: m.status,
                split_amount: m.split_amount,
            })
            .collect(),
        status: cart.status,
        notes: cart.notes.clone(),
        is_public: cart.is_public,
        max_distance: cart.max_distance,
        expires_at: cart.expires_at,
        order_time: cart.order_time,
        delivery_time: cart.delivery_time,
        chat_enabled: cart.chat_enabled,
        total_orders: cart.total_orders,
        created_at: cart.created_at,
        updated_at: cart.updated_at,
        distance,
    }
}

fn referenced_ids(carts: &[&Cart]) -> Vec<String> {
    let mut ids: Vec<String> = carts
        .iter()
        .flat_map(|c| {
            std::iter::once(c.creator.clone()).chain(c.members.iter().map(|m| m.user.clone()))
        })
        .collect();
    ids.sort();
    ids.dedup();

    ids
}

async fn view_of(
    conn: &mut ConnectionManager,
    cart: &Cart,
    distance: Option<f64>,
    contact: bool,
) -> Result<CartView, AppError> {
    let users = fetch_users(conn, &referenced_ids(&[cart])).await?;

    Ok(build_view(cart, &users, distance, contact))
}

pub async fn load_cart(conn: &mut ConnectionManager, id: &str) -> Result<Cart, AppError> {
    get_doc(conn, &cart_key(id))
        .await?
        .ok_or(AppError::NotFound("Cart"))
}

/// Joinable carts keep a TTL so Redis expires them like the original's TTL
/// index did; a plain SET on any later transition clears it.
pub async fn save_cart(conn: &mut ConnectionManager, cart: &Cart) -> Result<(), AppError> {
    if cart.is_joinable() {
        let ttl = (cart.expires_at - Utc::now()).num_seconds().max(1) as u64;
        put_doc_ex(conn, &cart_key(&cart.id), cart, ttl).await
    } else {
        put_doc(conn, &cart_key(&cart.id), cart).await
    }
}

/// Pull every cart out of the index, dropping ids whose blob has expired.
async fn load_all_carts(conn: &mut ConnectionManager) -> Result<Vec<Cart>, AppError> {
    let ids: Vec<String> = conn.smembers(CARTS_INDEX).await?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let keys: Vec<String> = ids.iter().map(|id| cart_key(id)).collect();
    let docs: Vec<Option<Cart>> = crate::database::mget_docs(conn, &keys).await?;

    let mut carts = Vec::with_capacity(docs.len());
    for (id, doc) in ids.into_iter().zip(docs) {
        match doc {
            Some(cart) => carts.push(cart),
            None => {
                let _: () = conn.srem(CARTS_INDEX, &id).await?;
            }
        }
    }

    Ok(carts)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    platform: Option<String>,
    max_distance: Option<f64>,
    city: Option<String>,
    status: Option<CartStatus>,
    sort_by: Option<String>,
    page: Option<usize>,
    limit: Option<usize>,
}

async fn list_carts(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();

    let has_location = geo::is_valid(&user.location.coordinates);
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(10).max(1);

    let mut carts: Vec<(Cart, f64)> = load_all_carts(&mut conn)
        .await?
        .into_iter()
        .filter(|cart| {
            cart.is_public
                && !cart.is_expired()
                && cart.creator != user.id
                && match query.status {
                    Some(status) => cart.status == status,
                    None => cart.is_joinable(),
                }
        })
        .filter(|cart| match query.platform.as_deref() {
            Some("all") | None => true,
            Some(platform) => cart.platform.as_str() == platform.to_lowercase(),
        })
        .filter(|cart| match query.city.as_deref() {
            Some("all") | None => true,
            Some(city) => cart.location.city == city,
        })
        .map(|cart| {
            let distance = if has_location {
                geo::distance_between(&user.location.coordinates, &cart.location.coordinates)
            } else {
                0.0
            };
            (cart, distance)
        })
        .collect();

    if has_location {
        carts.retain(|(cart, distance)| match query.max_distance {
            Some(max) => *distance <= max,
            None => *distance <= cart.max_distance,
        });
    }

    match query.sort_by.as_deref() {
        Some("distance") if has_location => {
            carts.sort_by(|a, b| a.1.total_cmp(&b.1));
        }
        Some("members") => {
            carts.sort_by(|a, b| b.0.members.len().cmp(&a.0.members.len()));
        }
        _ => carts.sort_by(|a, b| b.0.created_at.cmp(&a.0.created_at)),
    }

    let total = carts.len();
    let total_pages = total.div_ceil(limit);
    let skip = (page - 1) * limit;
    let page_carts: Vec<(Cart, f64)> = carts.into_iter().skip(skip).take(limit).collect();

    let cart_refs: Vec<&Cart> = page_carts.iter().map(|(c, _)| c).collect();
    let users = fetch_users(&mut conn, &referenced_ids(&cart_refs)).await?;

    let views: Vec<CartView> = page_carts
        .iter()
        .map(|(cart, distance)| {
            build_view(cart, &users, has_location.then_some(*distance), false)
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "count": views.len(),
        "total": total,
        "totalPages": total_pages,
        "currentPage": page,
        "data": views,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCartRequest {
    platform: Platform,
    location: Option<Location>,
    delivery_charge: Option<u32>,
    max_members: Option<u32>,
    notes: Option<String>,
    is_public: Option<bool>,
    max_distance: Option<f64>,
    chat_enabled: Option<bool>,
    expires_at: Option<DateTime<Utc>>,
}

fn validate_limits(
    max_members: u32,
    max_distance: f64,
    notes: Option<&String>,
) -> Result<(), AppError> {
    if !(2..=10).contains(&max_members) {
        return Err(AppError::Validation(
            "Maximum members must be between 2 and 10".to_string(),
        ));
    }

    if !(0.5..=5.0).contains(&max_distance) {
        return Err(AppError::Validation(
            "Maximum distance must be between 0.5 and 5 km".to_string(),
        ));
    }

    if notes.is_some_and(|n| n.len() > 500) {
        return Err(AppError::Validation(
            "Notes cannot be more than 500 characters".to_string(),
        ));
    }

    Ok(())
}

async fn create_cart(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(payload): Json<CreateCartRequest>,
) -> Result<impl IntoResponse, AppError> {
    let location = payload.location.unwrap_or_else(|| user.location.clone());
    let delivery_charge = payload.delivery_charge.unwrap_or(50);
    let max_members = payload.max_members.unwrap_or(4);
    let max_distance = payload.max_distance.unwrap_or(2.0);

    validate_limits(max_members, max_distance, payload.notes.as_ref())?;

    let mut cart = Cart::new(&user, payload.platform, location, delivery_charge, max_members);
    cart.notes = payload.notes;
    cart.max_distance = max_distance;
    if let Some(is_public) = payload.is_public {
        cart.is_public = is_public;
    }
    if let Some(chat_enabled) = payload.chat_enabled {
        cart.chat_enabled = chat_enabled;
    }
    if let Some(expires_at) = payload.expires_at {
        cart.expires_at = expires_at;
    }

    let mut conn = state.redis.clone();
    save_cart(&mut conn, &cart).await?;
    let _: () = conn.sadd(CARTS_INDEX, &cart.id).await?;

    let view = view_of(&mut conn, &cart, None, false).await?;
    state.rooms.publish(
        GLOBAL_ROOM,
        &ServerEvent::CartCreated {
            cart: serde_json::to_value(&view)?,
        },
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": view })),
    ))
}

async fn get_cart(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let cart = load_cart(&mut conn, &id).await?;

    let distance = geo::distance_between(&user.location.coordinates, &cart.location.coordinates);
    let view = view_of(&mut conn, &cart, Some(distance), true).await?;

    Ok(Json(json!({ "success": true, "data": view })))
}

async fn my_carts(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();

    let mut carts: Vec<Cart> = load_all_carts(&mut conn)
        .await?
        .into_iter()
        .filter(|cart| cart.is_member(&user.id))
        .collect();
    carts.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let cart_refs: Vec<&Cart> = carts.iter().collect();
    let users = fetch_users(&mut conn, &referenced_ids(&cart_refs)).await?;

    let views: Vec<CartView> = carts
        .iter()
        .map(|cart| build_view(cart, &users, None, false))
        .collect();

    Ok(Json(json!({
        "success": true,
        "count": views.len(),
        "data": views,
    })))
}

async fn join_cart(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let mut cart = load_cart(&mut conn, &id).await?;

    if cart.is_expired() {
        return Err(AppError::Conflict("This cart has expired".to_string()));
    }

    if !cart.is_joinable() {
        return Err(AppError::Conflict("Cannot join this cart".to_string()));
    }

    let distance =
        geo::distance_between(&user.location.coordinates, &cart.location.coordinates);
    if distance > cart.max_distance {
        return Err(AppError::Conflict(format!(
            "You are {distance:.1}km away. Maximum allowed distance is {}km",
            cart.max_distance
        )));
    }

    cart.add_member(&user.id)?;
    save_cart(&mut conn, &cart).await?;

    let view = view_of(&mut conn, &cart, None, false).await?;
    state.rooms.publish(
        &cart_room(&cart.id),
        &ServerEvent::CartMemberJoined {
            cart: serde_json::to_value(&view)?,
            user: user.without_password()?,
        },
    );

    Ok(Json(json!({ "success": true, "data": view })))
}

async fn leave_cart(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let mut cart = load_cart(&mut conn, &id).await?;

    if cart.creator == user.id {
        return Err(AppError::Conflict(
            "Creator cannot leave the cart. Please delete the cart instead.".to_string(),
        ));
    }

    if cart.order_locked() {
        return Err(AppError::Conflict(
            "Cannot leave cart after order is placed".to_string(),
        ));
    }

    cart.remove_member(&user.id);
    save_cart(&mut conn, &cart).await?;

    let view = view_of(&mut conn, &cart, None, false).await?;
    state.rooms.publish(
        &cart_room(&cart.id),
        &ServerEvent::CartMemberLeft {
            cart: serde_json::to_value(&view)?,
            user_id: user.id.clone(),
        },
    );

    Ok(Json(json!({ "success": true, "data": view })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateCartRequest {
    location: Option<Location>,
    delivery_charge: Option<u32>,
    max_members: Option<u32>,
    notes: Option<String>,
    is_public: Option<bool>,
    max_distance: Option<f64>,
    chat_enabled: Option<bool>,
    expires_at: Option<DateTime<Utc>>,
}

async fn update_cart(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(payload): Json<UpdateCartRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let mut cart = load_cart(&mut conn, &id).await?;

    if cart.creator != user.id {
        return Err(AppError::Forbidden(
            "Not authorized to update this cart".to_string(),
        ));
    }

    if cart.order_locked() {
        return Err(AppError::Conflict(
            "Cannot update cart after order is placed".to_string(),
        ));
    }

    if let Some(location) = payload.location {
        cart.location = location;
    }
    if let Some(charge) = payload.delivery_charge {
        cart.delivery_charge = charge;
        cart.recompute_split();
    }
    if let Some(max_members) = payload.max_members {
        cart.max_members = max_members;
    }
    if let Some(notes) = payload.notes {
        cart.notes = Some(notes);
    }
    if let Some(is_public) = payload.is_public {
        cart.is_public = is_public;
    }
    if let Some(max_distance) = payload.max_distance {
        cart.max_distance = max_distance;
    }
    if let Some(chat_enabled) = payload.chat_enabled {
        cart.chat_enabled = chat_enabled;
    }
    if let Some(expires_at) = payload.expires_at {
        cart.expires_at = expires_at;
    }

    validate_limits(cart.max_members, cart.max_distance, cart.notes.as_ref())?;

    if (cart.members.len() as u32) < cart.max_members && cart.status == CartStatus::Full {
        cart.status = CartStatus::Active;
    } else if cart.is_full() && cart.status == CartStatus::Active {
        cart.status = CartStatus::Full;
    }
    cart.updated_at = Utc::now();

    save_cart(&mut conn, &cart).await?;

    let view = view_of(&mut conn, &cart, None, false).await?;
    state.rooms.publish(
        &cart_room(&cart.id),
        &ServerEvent::CartUpdated {
            cart: serde_json::to_value(&view)?,
        },
    );

    Ok(Json(json!({ "success": true, "data": view })))
}

async fn delete_cart(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let cart = load_cart(&mut conn, &id).await?;

    if cart.creator != user.id {
        return Err(AppError::Forbidden(
            "Not authorized to delete this cart".to_string(),
        ));
    }

    if cart.order_locked() {
        return Err(AppError::Conflict(
            "Cannot delete cart after order is placed".to_string(),
        ));
    }

    let _: () = conn.del(cart_key(&cart.id)).await?;
    let _: () = conn.srem(CARTS_INDEX, &cart.id).await?;

    state.rooms.publish(
        &cart_room(&cart.id),
        &ServerEvent::CartDeleted {
            cart_id: cart.id.clone(),
        },
    );

    Ok(Json(json!({ "success": true, "data": {} })))
}
