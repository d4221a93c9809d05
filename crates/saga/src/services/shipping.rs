//! Shipping service: creates the shipment for a paid order.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use service_client::{RemoteRequest, ServiceClient};

use super::{CallError, SHIPPING_SERVICE, extract_id, id_value, today};

#[async_trait]
pub trait ShippingService: Send + Sync {
    /// Creates a shipment for an order and returns the shipping ID.
    async fn create_shipment(&self, order_id: &str, address: &str) -> Result<String, CallError>;
}

pub struct RemoteShippingService {
    client: Arc<ServiceClient>,
}

impl RemoteShippingService {
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ShippingService for RemoteShippingService {
    async fn create_shipment(&self, order_id: &str, address: &str) -> Result<String, CallError> {
        let body = json!({
            "shippingDate": today(),
            "shippingAddress": address,
            "orderId": id_value(order_id),
        });
        let response = self
            .client
            .call(
                SHIPPING_SERVICE,
                &RemoteRequest::post("create_shipment", "/shipping-service/api/shippings", body),
            )
            .await?;
        extract_id(&response, "shippingId")
    }
}
