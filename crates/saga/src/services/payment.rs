//! Payment service: captures the order fee and refunds it during compensation.

use std::sync::Arc;

use async_trait::async_trait;
use common::{Money, PaymentMethod};
use serde_json::json;
use service_client::{RemoteRequest, ServiceClient};

use super::{CallError, PAYMENT_SERVICE, extract_id, id_value, today};

#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Captures `amount` for an order and returns the payment ID.
    async fn capture_payment(
        &self,
        order_id: &str,
        method: PaymentMethod,
        amount: Money,
    ) -> Result<String, CallError>;

    /// Refunds a previously captured payment.
    async fn refund_payment(&self, payment_id: &str) -> Result<(), CallError>;
}

pub struct RemotePaymentService {
    client: Arc<ServiceClient>,
}

impl RemotePaymentService {
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PaymentService for RemotePaymentService {
    async fn capture_payment(
        &self,
        order_id: &str,
        method: PaymentMethod,
        amount: Money,
    ) -> Result<String, CallError> {
        let body = json!({
            "paymentDate": today(),
            "paymentMethod": method.as_str(),
            "fee": amount.as_decimal(),
            "isPaid": true,
            "orderId": id_value(order_id),
        });
        let response = self
            .client
            .call(
                PAYMENT_SERVICE,
                &RemoteRequest::post("capture_payment", "/payment-service/api/payments", body),
            )
            .await?;
        extract_id(&response, "paymentId")
    }

    async fn refund_payment(&self, payment_id: &str) -> Result<(), CallError> {
        let request = RemoteRequest::delete(
            "refund_payment",
            format!("/payment-service/api/payments/{payment_id}"),
        );
        self.client.call(PAYMENT_SERVICE, &request).await?;
        Ok(())
    }
}
