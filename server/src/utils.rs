use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric, thread_rng};

/// Human-facing order numbers: `SC` + base36 millis + 5 random characters,
/// all uppercase.
pub fn order_number() -> String {
    let timestamp = base36(Utc::now().timestamp_millis() as u128);
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect();

    format!("SC{}{}", timestamp, suffix.to_uppercase())
}

/// Opaque per-member payment reference handed out at checkout.
pub fn payment_ref() -> String {
    let id: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(14)
        .map(char::from)
        .collect();

    format!("pay_{id}")
}

fn base36(mut n: u128) -> String {
    const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

    if n == 0 {
        return "0".to_string();
    }

    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();

    String::from_utf8(out).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "Z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(36 * 36 + 1), "101");
    }

    #[test]
    fn test_order_number_shape() {
        let number = order_number();

        assert!(number.starts_with("SC"));
        assert!(number.len() > 7);
        assert!(number.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_payment_ref_shape() {
        let reference = payment_ref();

        assert!(reference.starts_with("pay_"));
        assert_eq!(reference.len(), 18);
        assert_ne!(reference, payment_ref());
    }
}
