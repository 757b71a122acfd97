//! Post-order reviews between cart members, feeding each user's rating,
//! review count and category breakdown.
use std::{collections::HashMap, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
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
    database::{
        ORDERS_INDEX, fetch_users, get_doc, mget_docs, order_key, put_doc, review_guard_key,
        review_key, reviews_by_key, reviews_for_key, user_key,
    },
    error::AppError,
    models::{
        DEFAULT_AVATAR, Order, OrderStatus, RatingBreakdown, Review, ReviewCategories, User,
    },
    state::AppState,
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_review))
        .route("/user/{user_id}", get(user_reviews))
        .route("/my", get(my_reviews))
        .route("/pending", get(pending_reviews))
        .route("/{id}", axum::routing::put(update_review).delete(delete_review))
        .route("/{id}/report", post(report_review))
}

fn round_avg(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

async fn load_reviews(
    conn: &mut ConnectionManager,
    index_key: &str,
) -> Result<Vec<Review>, AppError> {
    let ids: Vec<String> = conn.smembers(index_key).await?;
    let keys: Vec<String> = ids.iter().map(|id| review_key(id)).collect();

    let mut reviews: Vec<Review> = mget_docs(conn, &keys).await?.into_iter().flatten().collect();
    reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(reviews)
}

/// Recompute the reviewee's aggregates from scratch. With no reviews left the
/// profile returns to its pristine 5.0.
async fn refresh_reviewee(conn: &mut ConnectionManager, reviewee: &str) -> Result<(), AppError> {
    let reviews = load_reviews(conn, &reviews_for_key(reviewee)).await?;

    let Some(mut user) = crate::database::fetch_user(conn, reviewee).await? else {
        return Ok(());
    };

    if reviews.is_empty() {
        user.rating = 5.0;
        user.review_count = 0;
        user.rating_breakdown = RatingBreakdown::default();
    } else {
        let count = reviews.len() as f64;

        user.rating = round_avg(reviews.iter().map(|r| r.rating as f64).sum::<f64>() / count);
        user.review_count = reviews.len() as u32;
        user.rating_breakdown = RatingBreakdown {
            punctuality: round_avg(
                reviews.iter().map(|r| r.categories.punctuality as f64).sum::<f64>() / count,
            ),
            communication: round_avg(
                reviews.iter().map(|r| r.categories.communication as f64).sum::<f64>() / count,
            ),
            reliability: round_avg(
                reviews.iter().map(|r| r.categories.reliability as f64).sum::<f64>() / count,
            ),
        };
    }

    put_doc(conn, &user_key(reviewee), &user).await
}

fn review_view(
    review: &Review,
    users: &HashMap<String, User>,
    mask_anonymous: bool,
) -> Result<Value, AppError> {
    let mut value = serde_json::to_value(review)?;

    if mask_anonymous && review.is_anonymous {
        value["reviewer"] = json!({ "name": "Anonymous", "avatar": DEFAULT_AVATAR });
    } else if let Some(reviewer) = users.get(&review.reviewer) {
        value["reviewer"] = serde_json::to_value(reviewer.summary())?;
    }

    if let Some(reviewee) = users.get(&review.reviewee) {
        value["reviewee"] = serde_json::to_value(reviewee.summary())?;
    }

    Ok(value)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateReviewRequest {
    order_id: String,
    reviewee_id: String,
    rating: u8,
    comment: Option<String>,
    categories: Option<ReviewCategories>,
    is_anonymous: Option<bool>,
}

async fn create_review(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(payload): Json<CreateReviewRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !(1..=5).contains(&payload.rating) {
        return Err(AppError::Validation(
            "Rating must be between 1 and 5".to_string(),
        ));
    }

    if payload.comment.as_ref().is_some_and(|c| c.len() > 500) {
        return Err(AppError::Validation(
            "Comment cannot be more than 500 characters".to_string(),
        ));
    }

    let mut conn = state.redis.clone();
    let order: Order = get_doc(&mut conn, &order_key(&payload.order_id))
        .await?
        .ok_or(AppError::NotFound("Order"))?;

    if order.member(&user.id).is_none() {
        return Err(AppError::Forbidden(
            "You were not part of this order".to_string(),
        ));
    }

    if order.member(&payload.reviewee_id).is_none() {
        return Err(AppError::Validation(
            "Reviewee was not part of this order".to_string(),
        ));
    }

    if user.id == payload.reviewee_id {
        return Err(AppError::Validation(
            "You cannot review yourself".to_string(),
        ));
    }

    let review = Review {
        id: Uuid::new_v4().to_string(),
        order: payload.order_id.clone(),
        reviewer: user.id.clone(),
        reviewee: payload.reviewee_id.clone(),
        rating: payload.rating,
        comment: payload.comment,
        categories: payload.categories.unwrap_or_default(),
        is_anonymous: payload.is_anonymous.unwrap_or(false),
        is_reported: false,
        report_reason: None,
        created_at: Utc::now(),
    };

    // SET NX guard keeps it one review per (order, reviewer, reviewee)
    let guard = review_guard_key(&payload.order_id, &user.id, &payload.reviewee_id);
    let claimed: bool = conn.set_nx(guard, &review.id).await?;
    if !claimed {
        return Err(AppError::Conflict(
            "You have already reviewed this user for this order".to_string(),
        ));
    }

    put_doc(&mut conn, &review_key(&review.id), &review).await?;
    let _: () = conn.sadd(reviews_for_key(&review.reviewee), &review.id).await?;
    let _: () = conn.sadd(reviews_by_key(&review.reviewer), &review.id).await?;

    refresh_reviewee(&mut conn, &review.reviewee).await?;

    let users = fetch_users(&mut conn, &[review.reviewer.clone(), review.reviewee.clone()]).await?;
    let view = review_view(&review, &users, false)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "data": view })),
    ))
}

async fn user_reviews(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();

    let reviews: Vec<Review> = load_reviews(&mut conn, &reviews_for_key(&user_id))
        .await?
        .into_iter()
        .filter(|r| !r.is_reported)
        .take(50)
        .collect();

    let mut ids: Vec<String> = reviews
        .iter()
        .flat_map(|r| [r.reviewer.clone(), r.reviewee.clone()])
        .collect();
    ids.sort();
    ids.dedup();
    let users = fetch_users(&mut conn, &ids).await?;

    let views: Vec<Value> = reviews
        .iter()
        .map(|r| review_view(r, &users, true))
        .collect::<Result<_, _>>()?;

    let stats = if reviews.is_empty() {
        Value::Null
    } else {
        let count = reviews.len() as f64;
        json!({
            "avgPunctuality": round_avg(
                reviews.iter().map(|r| r.categories.punctuality as f64).sum::<f64>() / count
            ),
            "avgCommunication": round_avg(
                reviews.iter().map(|r| r.categories.communication as f64).sum::<f64>() / count
            ),
            "avgReliability": round_avg(
                reviews.iter().map(|r| r.categories.reliability as f64).sum::<f64>() / count
            ),
            "totalReviews": reviews.len(),
        })
    };

    Ok(Json(json!({
        "success": true,
        "count": views.len(),
        "data": views,
        "stats": stats,
    })))
}

async fn my_reviews(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let reviews = load_reviews(&mut conn, &reviews_by_key(&user.id)).await?;

    let mut ids: Vec<String> = reviews.iter().map(|r| r.reviewee.clone()).collect();
    ids.push(user.id.clone());
    ids.sort();
    ids.dedup();
    let users = fetch_users(&mut conn, &ids).await?;

    let views: Vec<Value> = reviews
        .iter()
        .map(|r| review_view(r, &users, false))
        .collect::<Result<_, _>>()?;

    Ok(Json(json!({
        "success": true,
        "count": views.len(),
        "data": views,
    })))
}

/// Delivered orders where the caller still owes a co-member a review.
async fn pending_reviews(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();

    let cart_ids: Vec<String> = conn.smembers(ORDERS_INDEX).await?;
    let keys: Vec<String> = cart_ids.iter().map(|id| order_key(id)).collect();

    let delivered: Vec<Order> = mget_docs(&mut conn, &keys)
        .await?
        .into_iter()
        .flatten()
        .filter(|order: &Order| {
            order.status == OrderStatus::Delivered && order.member(&user.id).is_some()
        })
        .collect();

    let mut pending = Vec::new();
    for order in &delivered {
        for member in &order.members {
            if member.user == user.id {
                continue;
            }

            let guard = review_guard_key(&order.cart, &user.id, &member.user);
            let reviewed: bool = conn.exists(guard).await?;
            if reviewed {
                continue;
            }

            let users = fetch_users(&mut conn, std::slice::from_ref(&member.user)).await?;
            pending.push(json!({
                "order": { "id": order.cart, "orderNumber": order.order_number },
                "user": users.get(&member.user).map(|u| u.summary()),
            }));
        }
    }

    Ok(Json(json!({
        "success": true,
        "count": pending.len(),
        "data": pending,
    })))
}

#[derive(Deserialize)]
struct UpdateReviewRequest {
    rating: Option<u8>,
    comment: Option<String>,
    categories: Option<ReviewCategories>,
}

async fn update_review(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(payload): Json<UpdateReviewRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let mut review: Review = get_doc(&mut conn, &review_key(&id))
        .await?
        .ok_or(AppError::NotFound("Review"))?;

    if review.reviewer != user.id {
        return Err(AppError::Forbidden(
            "Not authorized to update this review".to_string(),
        ));
    }

    if let Some(rating) = payload.rating {
        if !(1..=5).contains(&rating) {
            return Err(AppError::Validation(
                "Rating must be between 1 and 5".to_string(),
            ));
        }
        review.rating = rating;
    }
    if let Some(comment) = payload.comment {
        review.comment = Some(comment);
    }
    if let Some(categories) = payload.categories {
        review.categories = categories;
    }

    put_doc(&mut conn, &review_key(&id), &review).await?;
    refresh_reviewee(&mut conn, &review.reviewee).await?;

    let users = fetch_users(&mut conn, &[review.reviewer.clone(), review.reviewee.clone()]).await?;
    let view = review_view(&review, &users, false)?;

    Ok(Json(json!({ "success": true, "data": view })))
}

async fn delete_review(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let review: Review = get_doc(&mut conn, &review_key(&id))
        .await?
        .ok_or(AppError::NotFound("Review"))?;

    if review.reviewer != user.id {
        return Err(AppError::Forbidden(
            "Not authorized to delete this review".to_string(),
        ));
    }

    let _: () = conn.del(review_key(&id)).await?;
    let _: () = conn.srem(reviews_for_key(&review.reviewee), &id).await?;
    let _: () = conn.srem(reviews_by_key(&review.reviewer), &id).await?;
    let _: () = conn
        .del(review_guard_key(&review.order, &review.reviewer, &review.reviewee))
        .await?;

    refresh_reviewee(&mut conn, &review.reviewee).await?;

    Ok(Json(json!({ "success": true, "data": {} })))
}

#[derive(Deserialize)]
struct ReportRequest {
    reason: Option<String>,
}

async fn report_review(
    State(state): State<Arc<AppState>>,
    AuthUser(_user): AuthUser,
    Path(id): Path<String>,
    Json(payload): Json<ReportRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut conn = state.redis.clone();
    let mut review: Review = get_doc(&mut conn, &review_key(&id))
        .await?
        .ok_or(AppError::NotFound("Review"))?;

    review.is_reported = true;
    review.report_reason = payload.reason;
    put_doc(&mut conn, &review_key(&id), &review).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Review reported successfully",
    })))
}

#[cfg(test)]
mod tests {
    use super::round_avg;

    #[test]
    fn test_rating_rounding() {
        assert_eq!(round_avg(4.0 + 1.0 / 3.0), 4.3);
        assert_eq!(round_avg(4.25), 4.3);
        assert_eq!(round_avg(5.0), 5.0);
    }
}
