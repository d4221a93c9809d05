//! Order service: creates the order and cancels it during compensation.

use std::sync::Arc;

use async_trait::async_trait;
use common::{OrderPayload, UserId};
use serde_json::json;
use service_client::{RemoteRequest, ServiceClient};

use super::{CallError, ORDER_SERVICE, extract_id, today};

#[async_trait]
pub trait OrderService: Send + Sync {
    /// Creates an order and returns its ID.
    async fn create_order(&self, user_id: UserId, order: &OrderPayload)
    -> Result<String, CallError>;

    /// Cancels a previously created order.
    async fn cancel_order(&self, order_id: &str) -> Result<(), CallError>;
}

pub struct RemoteOrderService {
    client: Arc<ServiceClient>,
}

impl RemoteOrderService {
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OrderService for RemoteOrderService {
    async fn create_order(
        &self,
        user_id: UserId,
        order: &OrderPayload,
    ) -> Result<String, CallError> {
        let body = json!({
            "orderDate": today(),
            "orderDesc": order.description.as_deref().unwrap_or(&order.sku),
            "orderFee": order.fee.as_decimal(),
            "sku": order.sku,
            "userId": user_id.as_i64(),
        });
        let response = self
            .client
            .call(
                ORDER_SERVICE,
                &RemoteRequest::post("create_order", "/order-service/api/orders", body),
            )
            .await?;
        extract_id(&response, "orderId")
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), CallError> {
        let request = RemoteRequest::delete(
            "cancel_order",
            format!("/order-service/api/orders/{order_id}"),
        );
        self.client.call(ORDER_SERVICE, &request).await?;
        Ok(())
    }
}
