//! Documents stored in Redis and their lifecycle rules.
//!
//! Everything is serialized as camelCase JSON, matching what the HTTP API
//! sends and what the store keeps. Money is integer rupees, coordinates are
//! GeoJSON `[longitude, latitude]` pairs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;

pub const DEFAULT_AVATAR: &str = "https://via.placeholder.com/150";
pub const CART_TTL_HOURS: i64 = 2;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Blinkit,
    Zepto,
    Swiggy,
    Bigbasket,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Blinkit => "blinkit",
            Platform::Zepto => "zepto",
            Platform::Swiggy => "swiggy",
            Platform::Bigbasket => "bigbasket",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    Active,
    Full,
    Ordering,
    Ordered,
    Delivered,
    Completed,
    Cancelled,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Joined,
    Confirmed,
    Paid,
    Completed,
    Cancelled,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PaymentPending,
    Confirmed,
    Preparing,
    OutForDelivery,
    Delivered,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::PaymentPending => "payment_pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::OutForDelivery => "out_for_delivery",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    System,
    Location,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub coordinates: [f64; 2],
    pub address: String,
    pub city: String,
    pub pincode: String,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            coordinates: [77.5946, 12.9716],
            address: "Bangalore".to_string(),
            city: "Bangalore".to_string(),
            pincode: "560001".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RatingBreakdown {
    pub punctuality: f64,
    pub communication: f64,
    pub reliability: f64,
}

impl Default for RatingBreakdown {
    fn default() -> Self {
        Self {
            punctuality: 5.0,
            communication: 5.0,
            reliability: 5.0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    /// Bcrypt hash. Stripped from every API projection.
    pub password: String,
    pub phone: String,
    pub location: Location,
    pub avatar: String,
    pub rating: f64,
    pub review_count: u32,
    pub rating_breakdown: RatingBreakdown,
    pub total_orders: u32,
    pub total_savings: u32,
    pub is_verified: bool,
    pub is_active: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(name: String, email: String, password_hash: String) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            name,
            email,
            password: password_hash,
            phone: "9999999999".to_string(),
            location: Location::default(),
            avatar: DEFAULT_AVATAR.to_string(),
            rating: 5.0,
            review_count: 0,
            rating_breakdown: RatingBreakdown::default(),
            total_orders: 0,
            total_savings: 0,
            is_verified: false,
            is_active: true,
            last_seen: now,
            created_at: now,
        }
    }

    /// Full document minus the password hash, for `/me`-style responses.
    pub fn without_password(&self) -> Result<Value, AppError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("password");
        }

        Ok(value)
    }

    pub fn summary(&self) -> PublicUser {
        PublicUser {
            id: self.id.clone(),
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            rating: self.rating,
            phone: None,
            email: None,
        }
    }

    pub fn contact_card(&self) -> PublicUser {
        PublicUser {
            phone: Some(self.phone.clone()),
            email: Some(self.email.clone()),
            ..self.summary()
        }
    }
}

/// What other users are allowed to see of a profile.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: String,
    pub name: String,
    pub avatar: String,
    pub rating: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CartMember {
    pub user: String,
    pub joined_at: DateTime<Utc>,
    pub status: MemberStatus,
    pub split_amount: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub id: String,
    pub creator: String,
    pub platform: Platform,
    pub location: Location,
    pub delivery_charge: u32,
    pub max_members: u32,
    pub members: Vec<CartMember>,
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
}

impl Cart {
    /// The creator joins their own cart immediately, carrying the full
    /// delivery charge until someone else shares it.
    pub fn new(
        creator: &User,
        platform: Platform,
        location: Location,
        delivery_charge: u32,
        max_members: u32,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            creator: creator.id.clone(),
            platform,
            location,
            delivery_charge,
            max_members,
            members: vec![CartMember {
                user: creator.id.clone(),
                joined_at: now,
                status: MemberStatus::Joined,
                split_amount: delivery_charge,
            }],
            status: CartStatus::Active,
            notes: None,
            is_public: true,
            max_distance: 2.0,
            expires_at: now + Duration::hours(CART_TTL_HOURS),
            order_time: None,
            delivery_time: None,
            chat_enabled: true,
            total_orders: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn split_amount(&self) -> u32 {
        let count = self.members.len() as u32;
        if count == 0 {
            return 0;
        }

        self.delivery_charge.div_ceil(count)
    }

    pub fn is_full(&self) -> bool {
        self.members.len() as u32 >= self.max_members
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.creator == user_id || self.members.iter().any(|m| m.user == user_id)
    }

    pub fn is_joinable(&self) -> bool {
        matches!(self.status, CartStatus::Active | CartStatus::Full)
    }

    /// Once ordering has begun the member list and the cart itself are frozen.
    pub fn order_locked(&self) -> bool {
        matches!(
            self.status,
            CartStatus::Ordering | CartStatus::Ordered | CartStatus::Delivered
        )
    }

    pub fn add_member(&mut self, user_id: &str) -> Result<(), AppError> {
        if self.is_full() {
            return Err(AppError::Conflict("Cart is full".to_string()));
        }

        if self.members.iter().any(|m| m.user == user_id) {
            return Err(AppError::Conflict(
                "User is already a member of this cart".to_string(),
            ));
        }

        self.members.push(CartMember {
            user: user_id.to_string(),
            joined_at: Utc::now(),
            status: MemberStatus::Joined,
            split_amount: 0,
        });
        self.recompute_split();

        if self.is_full() {
            self.status = CartStatus::Full;
        }
        self.updated_at = Utc::now();

        Ok(())
    }

    pub fn remove_member(&mut self, user_id: &str) {
        self.members.retain(|m| m.user != user_id);
        self.recompute_split();

        if !self.is_full() && self.status == CartStatus::Full {
            self.status = CartStatus::Active;
        }
        self.updated_at = Utc::now();
    }

    pub fn recompute_split(&mut self) {
        let split = self.split_amount();
        for member in &mut self.members {
            member.split_amount = split;
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OrderMember {
    pub user: String,
    pub split_amount: u32,
    pub payment_status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub cart: String,
    pub order_number: String,
    pub platform: Platform,
    pub members: Vec<OrderMember>,
    pub total_amount: u32,
    pub delivery_charge: u32,
    pub delivery_location: Location,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_placed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Snapshots the cart's membership and split amounts; payments reconcile
    /// against this, not the live cart.
    pub fn for_cart(cart: &Cart, order_number: String) -> Self {
        Self {
            cart: cart.id.clone(),
            order_number,
            platform: cart.platform,
            members: cart
                .members
                .iter()
                .map(|m| OrderMember {
                    user: m.user.clone(),
                    split_amount: m.split_amount,
                    payment_status: PaymentStatus::Pending,
                    payment_ref: None,
                    payment_id: None,
                    signature: None,
                    paid_at: None,
                })
                .collect(),
            total_amount: cart.delivery_charge,
            delivery_charge: cart.delivery_charge,
            delivery_location: cart.location.clone(),
            status: OrderStatus::PaymentPending,
            order_placed_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn member(&self, user_id: &str) -> Option<&OrderMember> {
        self.members.iter().find(|m| m.user == user_id)
    }

    pub fn member_mut(&mut self, user_id: &str) -> Option<&mut OrderMember> {
        self.members.iter_mut().find(|m| m.user == user_id)
    }

    pub fn all_paid(&self) -> bool {
        self.members
            .iter()
            .all(|m| m.payment_status == PaymentStatus::Paid)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MessageLocation {
    pub coordinates: [f64; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub cart: String,
    pub sender: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<MessageLocation>,
    pub read_by: Vec<ReadReceipt>,
    pub is_edited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn read_by_user(&self, user_id: &str) -> bool {
        self.read_by.iter().any(|r| r.user == user_id)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCategories {
    pub punctuality: u8,
    pub communication: u8,
    pub reliability: u8,
}

impl Default for ReviewCategories {
    fn default() -> Self {
        Self {
            punctuality: 5,
            communication: 5,
            reliability: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: String,
    pub order: String,
    pub reviewer: String,
    pub reviewee: String,
    pub rating: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub categories: ReviewCategories,
    pub is_anonymous: bool,
    pub is_reported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user(name: &str) -> User {
        User::new(
            name.to_string(),
            format!("{name}@example.com"),
            "hash".to_string(),
        )
    }

    fn test_cart(charge: u32, max_members: u32) -> Cart {
        Cart::new(
            &test_user("asha"),
            Platform::Blinkit,
            Location::default(),
            charge,
            max_members,
        )
    }

    #[test]
    fn test_creator_carries_full_charge() {
        let cart = test_cart(50, 4);

        assert_eq!(cart.members.len(), 1);
        assert_eq!(cart.members[0].split_amount, 50);
        assert_eq!(cart.status, CartStatus::Active);
    }

    #[test]
    fn test_split_rounds_up() {
        let mut cart = test_cart(50, 4);
        cart.add_member("u2").unwrap();
        cart.add_member("u3").unwrap();

        // ceil(50 / 3) = 17 for everyone, creator included
        assert!(cart.members.iter().all(|m| m.split_amount == 17));
    }

    #[test]
    fn test_join_marks_full() {
        let mut cart = test_cart(60, 2);
        cart.add_member("u2").unwrap();

        assert_eq!(cart.status, CartStatus::Full);
        assert!(cart.add_member("u3").is_err());
    }

    #[test]
    fn test_duplicate_join_rejected() {
        let mut cart = test_cart(60, 4);
        cart.add_member("u2").unwrap();

        assert!(cart.add_member("u2").is_err());
    }

    #[test]
    fn test_leave_reopens_cart() {
        let mut cart = test_cart(60, 2);
        cart.add_member("u2").unwrap();
        assert_eq!(cart.status, CartStatus::Full);

        cart.remove_member("u2");

        assert_eq!(cart.status, CartStatus::Active);
        assert_eq!(cart.members.len(), 1);
        assert_eq!(cart.members[0].split_amount, 60);
    }

    #[test]
    fn test_order_lock_states() {
        let mut cart = test_cart(60, 4);
        assert!(!cart.order_locked());

        cart.status = CartStatus::Ordering;
        assert!(cart.order_locked());
        assert!(!cart.is_joinable());
    }

    #[test]
    fn test_order_snapshot_and_reconciliation() {
        let mut cart = test_cart(90, 4);
        cart.add_member("u2").unwrap();

        let mut order = Order::for_cart(&cart, "SCTEST123".to_string());
        assert_eq!(order.members.len(), 2);
        assert_eq!(order.members[0].split_amount, 45);
        assert!(!order.all_paid());

        for member in &mut order.members {
            member.payment_status = PaymentStatus::Paid;
        }
        assert!(order.all_paid());
    }

    #[test]
    fn test_public_projection_hides_password() {
        let user = test_user("ravi");
        let value = user.without_password().unwrap();

        assert!(value.get("password").is_none());
        assert_eq!(value["name"], "ravi");
    }
}
