use base64::{engine::general_purpose::STANDARD, Engine as _};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

/// Success value gateways send in their result code field.
const RESULT_CODE_SUCCESS: i32 = 0;

/// Normalized payment-gateway callback (wallet IPN or card webhook), after
/// signature verification at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCallback {
    pub payment_request_id: String,
    pub amount: Decimal,
    /// Gateway-side correlation id (wallet order id / card session id).
    pub gateway_ref: String,
    pub result_code: i32,
    /// Opaque application token round-tripped through the gateway.
    pub token: String,
}

impl GatewayCallback {
    pub fn is_success(&self) -> bool {
        self.result_code == RESULT_CODE_SUCCESS
    }
}

/// Application state smuggled through the gateway redirect, recovered from
/// the callback token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionToken {
    #[serde(default)]
    pub order_id: Option<Uuid>,
    #[serde(default)]
    pub order_number: Option<String>,
    pub is_new_order: bool,
}

pub fn encode_promotion_token(token: &PromotionToken) -> Result<String, ServiceError> {
    let json = serde_json::to_vec(token)?;
    Ok(STANDARD.encode(json))
}

pub fn decode_promotion_token(raw: &str) -> Result<PromotionToken, ServiceError> {
    let bytes = STANDARD
        .decode(raw)
        .map_err(|e| ServiceError::SerializationError(format!("invalid gateway token: {e}")))?;
    let token = serde_json::from_slice(&bytes)?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips() {
        let token = PromotionToken {
            order_id: Some(Uuid::new_v4()),
            order_number: Some("YM2405011234".to_string()),
            is_new_order: false,
        };
        let encoded = encode_promotion_token(&token).unwrap();
        assert_eq!(decode_promotion_token(&encoded).unwrap(), token);
    }

    #[test]
    fn new_order_token_needs_no_order_id() {
        let token = PromotionToken {
            order_id: None,
            order_number: None,
            is_new_order: true,
        };
        let encoded = encode_promotion_token(&token).unwrap();
        let decoded = decode_promotion_token(&encoded).unwrap();
        assert!(decoded.is_new_order);
        assert!(decoded.order_id.is_none());
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(decode_promotion_token("not-base64!!").is_err());
        let not_json = STANDARD.encode(b"plain text");
        assert!(decode_promotion_token(&not_json).is_err());
    }

    #[test]
    fn result_code_gates_success() {
        let mut callback = GatewayCallback {
            payment_request_id: "req-1".into(),
            amount: Decimal::new(1000, 0),
            gateway_ref: "wallet-77".into(),
            result_code: 0,
            token: String::new(),
        };
        assert!(callback.is_success());
        callback.result_code = 49;
        assert!(!callback.is_success());
    }
}
