//! Caller identity used to key rate-limit windows.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Bucket shared by callers that present no identifying attribute.
pub const ANONYMOUS: &str = "anonymous";

/// Length of the hex key derived from an identity.
const KEY_LEN: usize = 16;

/// Attributes available about whoever issued a request.
///
/// Every attribute is optional; callers with none of them collapse onto the
/// shared anonymous bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Option<String>,
    pub address: Option<String>,
    pub account_id: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Build an identity from request metadata, reading the account id from
    /// the JSON body.
    pub fn from_request(user_id: Option<&str>, address: Option<&str>, body: &Value) -> Self {
        Self {
            user_id: user_id.map(str::to_string),
            address: address.map(str::to_string),
            account_id: Self::account_id_from_body(body),
        }
    }

    /// Account id carried in a request body as `customerId` or `customer_id`.
    pub fn account_id_from_body(body: &Value) -> Option<String> {
        let field = |name: &str| match body.get(name)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        field("customerId").or_else(|| field("customer_id"))
    }

    pub fn is_anonymous(&self) -> bool {
        self.parts().next().is_none()
    }

    /// Stable bucket key: the first 16 hex chars of SHA-256 over the present
    /// attributes joined by `:`.
    pub fn key(&self) -> String {
        let joined = self.parts().collect::<Vec<_>>().join(":");
        let material = if joined.is_empty() { ANONYMOUS } else { joined.as_str() };

        let mut key = hex::encode(Sha256::digest(material.as_bytes()));
        key.truncate(KEY_LEN);
        key
    }

    fn parts(&self) -> impl Iterator<Item = &str> {
        [&self.user_id, &self.address, &self.account_id]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .filter(|part| !part.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_is_stable_and_sixteen_hex_chars() {
        let id = Identity::user("u-1").with_address("10.0.0.1");
        let key = id.key();
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, id.clone().key());
    }

    #[test]
    fn missing_attributes_share_the_anonymous_bucket() {
        let empty = Identity::anonymous();
        let blank = Identity::user("");
        assert!(empty.is_anonymous());
        assert!(blank.is_anonymous());
        assert_eq!(empty.key(), blank.key());
    }

    #[test]
    fn different_attributes_give_different_keys() {
        let a = Identity::user("u-1");
        let b = Identity::user("u-1").with_account_id("123-456-7890");
        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), Identity::anonymous().key());
    }

    #[test]
    fn account_id_is_read_from_either_spelling() {
        assert_eq!(
            Identity::account_id_from_body(&json!({"customerId": "111"})),
            Some("111".to_string())
        );
        assert_eq!(
            Identity::account_id_from_body(&json!({"customer_id": 222})),
            Some("222".to_string())
        );
        assert_eq!(Identity::account_id_from_body(&json!({"customerId": ""})), None);
        assert_eq!(Identity::account_id_from_body(&json!(null)), None);
    }

    #[test]
    fn from_request_combines_headers_and_body() {
        let id = Identity::from_request(Some("u-9"), Some("::1"), &json!({"customerId": "42"}));
        assert_eq!(id.user_id.as_deref(), Some("u-9"));
        assert_eq!(id.address.as_deref(), Some("::1"));
        assert_eq!(id.account_id.as_deref(), Some("42"));
    }
}
