//! Cache key naming.

/// Locally-held (not yet synced) annotations for a customer.
pub fn comments_key(customer_id: &str) -> String {
    format!("customer_comments_{customer_id}")
}

/// Last canonical annotation list fetched from the Record Store, served when
/// it is unreachable.
pub fn synced_comments_key(customer_id: &str) -> String {
    format!("customer_comments_{customer_id}_synced")
}
