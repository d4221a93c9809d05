//! User service: confirms the buyer exists before anything is created.

use std::sync::Arc;

use async_trait::async_trait;
use common::UserId;
use service_client::{RemoteRequest, ServiceClient};

use super::{CallError, USER_SERVICE};

#[async_trait]
pub trait UserService: Send + Sync {
    /// Succeeds if the user exists. A missing user is a 404 rejection.
    async fn validate_user(&self, user_id: UserId) -> Result<(), CallError>;
}

pub struct RemoteUserService {
    client: Arc<ServiceClient>,
}

impl RemoteUserService {
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UserService for RemoteUserService {
    async fn validate_user(&self, user_id: UserId) -> Result<(), CallError> {
        let request =
            RemoteRequest::get("validate_user", format!("/user-service/api/users/{user_id}"));
        self.client.call(USER_SERVICE, &request).await?;
        Ok(())
    }
}
