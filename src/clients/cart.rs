use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::ServiceError;

/// Cart backend the promoter clears after a confirmed checkout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CartClient: Send + Sync {
    async fn clear_cart(&self, user_id: Uuid) -> Result<(), ServiceError>;
}
