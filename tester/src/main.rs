//! Drives a running ShareCart server end to end: two users, one cart, a
//! join, chat, and the split-payment flow.
//!
//! ```sh
//! RUST_PORT=5000 PAYMENT_KEY_SECRET=... cargo run -p tester
//! ```
//!
//! Without `PAYMENT_KEY_SECRET` the payment leg only asserts that a bad
//! signature is rejected.
use std::env;

use anyhow::{Context, Result, bail};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{Value, json};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

struct Api {
    client: Client,
    base: String,
}

impl Api {
    async fn post(&self, path: &str, token: Option<&str>, body: Value) -> Result<Value> {
        let mut request = self.client.post(format!("{}{path}", self.base)).json(&body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        Ok(request.send().await?.json().await?)
    }

    async fn get(&self, path: &str, token: &str) -> Result<Value> {
        Ok(self
            .client
            .get(format!("{}{path}", self.base))
            .bearer_auth(token)
            .send()
            .await?
            .json()
            .await?)
    }
}

fn sign(secret: &str, payment_ref: &str, payment_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{payment_ref}|{payment_id}").as_bytes());

    hex::encode(mac.finalize().into_bytes())
}

async fn register(api: &Api, name: &str, suffix: u128) -> Result<(String, String)> {
    let response = api
        .post(
            "/api/auth/register",
            None,
            json!({
                "name": name,
                "email": format!("{}-{suffix}@example.com", name.to_lowercase()),
                "password": "password123",
                "phone": "9876543210",
            }),
        )
        .await?;

    let token = response["token"]
        .as_str()
        .context("no token in register response")?
        .to_string();
    let id = response["data"]["id"]
        .as_str()
        .context("no id in register response")?
        .to_string();

    println!("Registered {name}: {id}");
    Ok((token, id))
}

async fn pay(api: &Api, token: &str, cart_id: &str, secret: &str) -> Result<bool> {
    let checkout = api
        .post("/api/payments/create-order", Some(token), json!({ "cartId": cart_id }))
        .await?;
    let payment_ref = checkout["data"]["orderId"]
        .as_str()
        .context("no payment ref")?;
    println!(
        "  checkout: {} owes {} INR",
        payment_ref, checkout["data"]["amount"]
    );

    let payment_id = format!("txn_{payment_ref}");
    let verified = api
        .post(
            "/api/payments/verify",
            Some(token),
            json!({
                "cartId": cart_id,
                "paymentRef": payment_ref,
                "paymentId": payment_id,
                "signature": sign(secret, payment_ref, &payment_id),
            }),
        )
        .await?;

    if verified["success"] != json!(true) {
        bail!("payment verify failed: {verified}");
    }

    Ok(verified["data"]["allPaid"] == json!(true))
}

#[tokio::main]
async fn main() -> Result<()> {
    let port: u16 = env::var("RUST_PORT")
        .unwrap_or_else(|_| "5000".to_string())
        .parse()?;
    let api = Api {
        client: Client::new(),
        base: format!("http://localhost:{port}"),
    };

    let health: Value = api
        .client
        .get(format!("{}/health", api.base))
        .send()
        .await?
        .json()
        .await?;
    println!("Health: {}", health["message"]);

    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_millis();

    let (token_a, id_a) = register(&api, "Asha", suffix).await?;
    let (token_b, _id_b) = register(&api, "Ravi", suffix).await?;

    // Put both users at the same spot so the distance gate passes
    for token in [&token_a, &token_b] {
        api.client
            .put(format!("{}/api/auth/location", api.base))
            .bearer_auth(token)
            .json(&json!({
                "coordinates": [77.5946, 12.9716],
                "address": "MG Road",
                "city": "Bangalore",
                "pincode": "560001",
            }))
            .send()
            .await?;
    }

    let created = api
        .post(
            "/api/carts",
            Some(&token_a),
            json!({ "platform": "blinkit", "deliveryCharge": 50, "maxMembers": 4 }),
        )
        .await?;
    let cart_id = created["data"]["id"]
        .as_str()
        .context("no cart id")?
        .to_string();
    println!("Created cart {cart_id}");

    let browse = api.get("/api/carts", &token_b).await?;
    println!("Ravi sees {} nearby cart(s)", browse["count"]);

    let joined = api
        .post(&format!("/api/carts/{cart_id}/join"), Some(&token_b), json!({}))
        .await?;
    let splits: Vec<_> = joined["data"]["members"]
        .as_array()
        .context("no members")?
        .iter()
        .map(|m| m["splitAmount"].clone())
        .collect();
    println!("After join, splits: {splits:?}");
    if splits != vec![json!(25), json!(25)] {
        bail!("expected an even 25/25 split, got {splits:?}");
    }

    api.post(
        "/api/messages",
        Some(&token_b),
        json!({ "cartId": cart_id, "content": "Joining in, adding milk to the list" }),
    )
    .await?;
    let messages = api.get(&format!("/api/messages/{cart_id}"), &token_a).await?;
    println!("Chat has {} message(s)", messages["count"]);

    match env::var("PAYMENT_KEY_SECRET") {
        Ok(secret) => {
            println!("Paying shares...");
            let first = pay(&api, &token_a, &cart_id, &secret).await?;
            println!("  Asha paid, allPaid = {first}");
            let second = pay(&api, &token_b, &cart_id, &secret).await?;
            println!("  Ravi paid, allPaid = {second}");

            if !second {
                bail!("all shares paid but order did not confirm");
            }

            let status = api
                .get(&format!("/api/payments/status/{cart_id}"), &token_a)
                .await?;
            println!(
                "Order {} is {}",
                status["data"]["orderNumber"], status["data"]["orderStatus"]
            );

            if status["data"]["orderStatus"] != json!("confirmed") {
                bail!(
                    "expected confirmed order, got {}",
                    status["data"]["orderStatus"]
                );
            }

            let me = api.get("/api/auth/me", &token_a).await?;
            println!(
                "{} ({id_a}) has saved {} INR over {} order(s)",
                me["data"]["name"], me["data"]["totalSavings"], me["data"]["totalOrders"]
            );
        }
        Err(_) => {
            println!("PAYMENT_KEY_SECRET not set, checking signature rejection only");

            let checkout = api
                .post(
                    "/api/payments/create-order",
                    Some(&token_a),
                    json!({ "cartId": cart_id }),
                )
                .await?;
            let payment_ref = checkout["data"]["orderId"].as_str().context("no ref")?;

            let rejected = api
                .post(
                    "/api/payments/verify",
                    Some(&token_a),
                    json!({
                        "cartId": cart_id,
                        "paymentRef": payment_ref,
                        "paymentId": "txn_forged",
                        "signature": "00".repeat(32),
                    }),
                )
                .await?;

            if rejected["success"] != json!(false) {
                bail!("forged signature was accepted: {rejected}");
            }
            println!("Forged signature rejected, as it should be");
        }
    }

    println!("\nAll checks passed");
    Ok(())
}
