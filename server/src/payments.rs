//! Split-payment reconciliation. Each member pays their share against the
//! cart's order; the last verified payment confirms the order and moves the
//! cart into `ordering`.
//!
//! Payment confirmations carry an HMAC-SHA256 signature over
//! `"{payment_ref}|{payment_id}"` keyed with the configured payment secret.
//! Gateway calls themselves are out of scope; only the signature check gates
//! the state transition.
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use redis::AsyncCommands;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::info;

use crate::{
    auth::AuthUser,
    carts::{load_cart, save_cart},
    database::{
        ORDERS_INDEX, fetch_users, get_doc, mget_docs, order_key, put_doc, user_key,
    },
    error::AppError,
    models::{CartStatus, Order, OrderStatus, PaymentStatus},
    state::AppState,
    utils::{order_number, payment_ref},
    ws::{ServerEvent, cart_room},
};

type HmacSha256 = Hmac<Sha256>;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/create-order", post(create_order))
        .route("/verify", post(verify_payment))
        .route("/status/{cart_id}", get(payment_status))
        .route("/orders", get(my_orders))
        .route("/refund", post(refund_payment))
}

pub fn orders_router() -> Router<Arc<AppState>> {
    Router::new().route("/{cart_id}/status", post(advance_order))
}

pub fn sign_payment(secret: &str, payment_ref: &str, payment_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(format!("{payment_ref}|{payment_id}").as_bytes());

    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_signature(secret: &str, payment_ref: &str, payment_id: &str, signature: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("{payment_ref}|{payment_id}").as_bytes());

    let Ok(expected) = hex::decode(signature) else {
        return false;
    };

    mac.verify_slice(&expected).is_ok()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderRequest {
    cart_id: String,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let cart = load_cart(&mut conn, &payload.cart_id).await?;

    if !cart.is_member(&user.id) {
        return Err(AppError::Forbidden(
            "You are not a member of this cart".to_string(),
        ));
    }

    // First caller materializes the order; everyone else reuses it
    let mut order: Order = match get_doc(&mut conn, &order_key(&cart.id)).await? {
        Some(order) => order,
        None => Order::for_cart(&cart, order_number()),
    };

    let reference = payment_ref();
    let member = order
        .member_mut(&user.id)
        .ok_or(AppError::Forbidden("You are not a member of this cart".to_string()))?;
    member.payment_ref = Some(reference.clone());
    let amount = member.split_amount;

    put_doc(&mut conn, &order_key(&cart.id), &order).await?;
    let _: () = conn.sadd(ORDERS_INDEX, &cart.id).await?;

    Ok(Json(json!({
        "success": true,
        "data": {
            "orderId": reference,
            "amount": amount,
            "currency": "INR",
            "orderNumber": order.order_number,
        },
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest {
    cart_id: String,
    payment_ref: String,
    payment_id: String,
    signature: String,
}

async fn verify_payment(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(payload): Json<VerifyRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !verify_signature(
        &state.config.payment_secret,
        &payload.payment_ref,
        &payload.payment_id,
        &payload.signature,
    ) {
        return Err(AppError::Validation(
            "Invalid payment signature".to_string(),
        ));
    }

    let mut conn = state.redis.clone();
    let mut order: Order = get_doc(&mut conn, &order_key(&payload.cart_id))
        .await?
        .ok_or(AppError::NotFound("Order"))?;

    let member = order
        .member_mut(&user.id)
        .ok_or(AppError::Forbidden("You are not a member of this cart".to_string()))?;

    if member.payment_ref.as_deref() != Some(payload.payment_ref.as_str()) {
        return Err(AppError::Validation(
            "Unknown payment reference".to_string(),
        ));
    }

    member.payment_status = PaymentStatus::Paid;
    member.payment_id = Some(payload.payment_id.clone());
    member.signature = Some(payload.signature.clone());
    member.paid_at = Some(Utc::now());

    let all_paid = order.all_paid();

    if all_paid {
        order.status = OrderStatus::Confirmed;
        order.order_placed_at = Some(Utc::now());

        let mut cart = load_cart(&mut conn, &payload.cart_id).await?;
        cart.status = CartStatus::Ordering;
        cart.order_time = Some(Utc::now());
        cart.total_orders += 1;
        cart.updated_at = Utc::now();
        save_cart(&mut conn, &cart).await?;

        // Every member saved the same share, so credit all of them
        let savings = order.delivery_charge / order.members.len() as u32;
        let ids: Vec<String> = order.members.iter().map(|m| m.user.clone()).collect();
        for (_, mut member_user) in fetch_users(&mut conn, &ids).await? {
            member_user.total_orders += 1;
            member_user.total_savings += savings;
            put_doc(&mut conn, &user_key(&member_user.id), &member_user).await?;
        }

        info!("Order {} confirmed, cart {} ordering", order.order_number, cart.id);
    }

    put_doc(&mut conn, &order_key(&payload.cart_id), &order).await?;

    state.rooms.publish(
        &cart_room(&payload.cart_id),
        &ServerEvent::PaymentCompleted {
            user_id: user.id.clone(),
            all_paid,
            order: serde_json::to_value(&order)?,
        },
    );

    Ok(Json(json!({
        "success": true,
        "message": "Payment verified successfully",
        "data": { "allPaid": all_paid, "order": order },
    })))
}

async fn payment_status(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Path(cart_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let order: Order = get_doc(&mut conn, &order_key(&cart_id))
        .await?
        .ok_or(AppError::NotFound("Order"))?;

    let ids: Vec<String> = order.members.iter().map(|m| m.user.clone()).collect();
    let users = fetch_users(&mut conn, &ids).await?;

    let payment_status: Vec<_> = order
        .members
        .iter()
        .map(|m| {
            json!({
                "user": users.get(&m.user).map(|u| u.summary()),
                "splitAmount": m.split_amount,
                "paymentStatus": m.payment_status,
                "paidAt": m.paid_at,
            })
        })
        .collect();

    let total_paid = order
        .members
        .iter()
        .filter(|m| m.payment_status == PaymentStatus::Paid)
        .count();
    let total_members = order.members.len();

    Ok(Json(json!({
        "success": true,
        "data": {
            "orderNumber": order.order_number,
            "totalAmount": order.total_amount,
            "totalPaid": total_paid,
            "totalMembers": total_members,
            "allPaid": total_paid == total_members,
            "paymentStatus": payment_status,
            "orderStatus": order.status,
        },
    })))
}

async fn my_orders(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();

    let cart_ids: Vec<String> = conn.smembers(ORDERS_INDEX).await?;
    let keys: Vec<String> = cart_ids.iter().map(|id| order_key(id)).collect();

    let mut orders: Vec<Order> = mget_docs(&mut conn, &keys)
        .await?
        .into_iter()
        .flatten()
        .filter(|order: &Order| order.member(&user.id).is_some())
        .collect();
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut formatted = Vec::with_capacity(orders.len());
    for order in &orders {
        let mut value = serde_json::to_value(order)?;
        value["myPayment"] = serde_json::to_value(order.member(&user.id))?;
        formatted.push(value);
    }

    Ok(Json(json!({
        "success": true,
        "count": formatted.len(),
        "data": formatted,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefundRequest {
    cart_id: String,
    user_id: String,
}

async fn refund_payment(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Json(payload): Json<RefundRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let mut order: Order = get_doc(&mut conn, &order_key(&payload.cart_id))
        .await?
        .ok_or(AppError::NotFound("Order"))?;

    let member = order
        .member_mut(&payload.user_id)
        .filter(|m| m.payment_status == PaymentStatus::Paid)
        .ok_or(AppError::Validation(
            "Payment not found or already refunded".to_string(),
        ))?;

    member.payment_status = PaymentStatus::Refunded;
    let refunded = member.clone();

    put_doc(&mut conn, &order_key(&payload.cart_id), &order).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Refund initiated successfully",
        "data": refunded,
    })))
}

#[derive(Deserialize)]
struct AdvanceRequest {
    status: OrderStatus,
}

/// Creator-only, forward-only order progression once payment has confirmed.
/// The cart mirrors the order so browse/detail views stay truthful.
async fn advance_order(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(cart_id): Path<String>,
    Json(payload): Json<AdvanceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let mut order: Order = get_doc(&mut conn, &order_key(&cart_id))
        .await?
        .ok_or(AppError::NotFound("Order"))?;
    let mut cart = load_cart(&mut conn, &cart_id).await?;

    if cart.creator != user.id {
        return Err(AppError::Forbidden(
            "Only the cart creator can update the order status".to_string(),
        ));
    }

    let allowed = matches!(
        (order.status, payload.status),
        (OrderStatus::Confirmed, OrderStatus::Preparing)
            | (OrderStatus::Preparing, OrderStatus::OutForDelivery)
            | (OrderStatus::OutForDelivery, OrderStatus::Delivered)
    );
    if !allowed {
        return Err(AppError::Conflict(format!(
            "Cannot move order from {} to {}",
            order.status.as_str(),
            payload.status.as_str()
        )));
    }

    order.status = payload.status;
    cart.status = match payload.status {
        OrderStatus::Delivered => {
            cart.delivery_time = Some(Utc::now());
            CartStatus::Delivered
        }
        _ => CartStatus::Ordered,
    };
    cart.updated_at = Utc::now();

    put_doc(&mut conn, &order_key(&cart_id), &order).await?;
    save_cart(&mut conn, &cart).await?;

    state.rooms.publish(
        &cart_room(&cart_id),
        &ServerEvent::OrderStatusChanged {
            status: order.status.as_str().to_string(),
            updated_by: user.name.clone(),
            timestamp: Utc::now(),
        },
    );

    Ok(Json(json!({ "success": true, "data": order })))
}

#[cfg(test)]
mod tests {
    use super::{sign_payment, verify_signature};

    #[test]
    fn test_signature_round_trip() {
        let signature = sign_payment("secret", "pay_abc", "txn_123");

        assert!(verify_signature("secret", "pay_abc", "txn_123", &signature));
    }

    #[test]
    fn test_signature_rejects_tampering() {
        let signature = sign_payment("secret", "pay_abc", "txn_123");

        assert!(!verify_signature("secret", "pay_abc", "txn_999", &signature));
        assert!(!verify_signature("other", "pay_abc", "txn_123", &signature));
        assert!(!verify_signature("secret", "pay_abc", "txn_123", "deadbeef"));
        assert!(!verify_signature("secret", "pay_abc", "txn_123", "not-hex"));
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let signature = sign_payment("secret", "pay_abc", "txn_123");

        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
