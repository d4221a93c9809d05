//! Inputs captured when a purchase saga starts.
//!
//! These are immutable once the saga exists; a repeated start request is
//! only idempotent if it carries exactly the same [`PurchaseInput`].

use serde::{Deserialize, Serialize};

use crate::types::{Money, UserId};

/// What the order service is asked to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPayload {
    /// Catalog SKU being purchased.
    pub sku: String,
    /// Free-text order description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Total order fee, charged by the payment step.
    pub fee: Money,
}

/// Payment methods accepted by the payment service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    CreditCard,
    DebitCard,
    Paypal,
    BankTransfer,
    CashOnDelivery,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::CreditCard => "CREDIT_CARD",
            PaymentMethod::DebitCard => "DEBIT_CARD",
            PaymentMethod::Paypal => "PAYPAL",
            PaymentMethod::BankTransfer => "BANK_TRANSFER",
            PaymentMethod::CashOnDelivery => "CASH_ON_DELIVERY",
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPayload {
    pub method: PaymentMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingPayload {
    pub address: String,
}

/// Everything a purchase saga needs from its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseInput {
    pub user_id: UserId,
    pub order: OrderPayload,
    pub payment: PaymentPayload,
    pub shipping: ShippingPayload,
}

/// A purchase input that breaks a shape rule. Detected before any remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct InputError {
    pub field: &'static str,
    pub reason: String,
}

impl InputError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl PurchaseInput {
    /// Checks the shape of the input. Semantic checks (does the user exist,
    /// is the card good) belong to the downstream services.
    pub fn validate(&self) -> Result<(), InputError> {
        if self.user_id.as_i64() <= 0 {
            return Err(InputError::new("user_id", "must be a positive integer"));
        }
        if self.order.sku.trim().is_empty() {
            return Err(InputError::new("order.sku", "must not be blank"));
        }
        if !self.order.fee.is_positive() {
            return Err(InputError::new("order.fee", "must be greater than zero"));
        }
        if self.shipping.address.trim().is_empty() {
            return Err(InputError::new("shipping_address", "must not be blank"));
        }
        Ok(())
    }
}
