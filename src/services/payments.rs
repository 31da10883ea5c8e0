use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use tracing::instrument;
use uuid::Uuid;

use crate::entities::order::{PaymentMethod, PaymentStatus};
use crate::entities::payment;
use crate::errors::ServiceError;

/// Service owning payment attempt records. One record per attempt; a
/// record may outlive the pending order it was created for.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
}

impl PaymentService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Opens a payment attempt in `Pending` state.
    #[instrument(skip(self), fields(payment_request_id = %payment_request_id))]
    pub async fn create_payment(
        &self,
        payment_request_id: &str,
        amount: Decimal,
        method: PaymentMethod,
        gateway_ref: Option<String>,
    ) -> Result<payment::Model, ServiceError> {
        let now = Utc::now();
        let attempt = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(None),
            amount: Set(amount),
            method: Set(method),
            status: Set(PaymentStatus::Pending),
            payment_request_id: Set(payment_request_id.to_string()),
            gateway_ref: Set(gateway_ref),
            gateway_response: Set(None),
            created_at: Set(now),
            updated_at: Set(None),
        };
        let created = attempt.insert(&*self.db).await?;
        Ok(created)
    }

    /// Most recent attempt for a payment request id.
    pub async fn find_by_request_id(
        &self,
        payment_request_id: &str,
    ) -> Result<Option<payment::Model>, ServiceError> {
        let found = payment::Entity::find()
            .filter(payment::Column::PaymentRequestId.eq(payment_request_id))
            .order_by_desc(payment::Column::CreatedAt)
            .one(&*self.db)
            .await?;
        Ok(found)
    }

    /// Records a gateway outcome against the attempt for this request id,
    /// creating the record when the attempt was opened outside this system.
    #[instrument(skip(self, gateway_response), fields(payment_request_id = %payment_request_id, success))]
    pub async fn record_gateway_result(
        &self,
        payment_request_id: &str,
        success: bool,
        amount: Decimal,
        method: PaymentMethod,
        gateway_ref: Option<String>,
        gateway_response: Option<serde_json::Value>,
        order_id: Option<Uuid>,
    ) -> Result<payment::Model, ServiceError> {
        let status = if success {
            PaymentStatus::Paid
        } else {
            PaymentStatus::Failed
        };

        match self.find_by_request_id(payment_request_id).await? {
            Some(existing) => {
                let existing_order = existing.order_id;
                let mut active: payment::ActiveModel = existing.into();
                active.status = Set(status);
                if gateway_ref.is_some() {
                    active.gateway_ref = Set(gateway_ref);
                }
                if gateway_response.is_some() {
                    active.gateway_response = Set(gateway_response);
                }
                if order_id.is_some() {
                    active.order_id = Set(order_id.or(existing_order));
                }
                active.updated_at = Set(Some(Utc::now()));
                let updated = active.update(&*self.db).await?;
                Ok(updated)
            }
            None => {
                let now = Utc::now();
                let attempt = payment::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    order_id: Set(order_id),
                    amount: Set(amount),
                    method: Set(method),
                    status: Set(status),
                    payment_request_id: Set(payment_request_id.to_string()),
                    gateway_ref: Set(gateway_ref),
                    gateway_response: Set(gateway_response),
                    created_at: Set(now),
                    updated_at: Set(Some(now)),
                };
                let created = attempt.insert(&*self.db).await?;
                Ok(created)
            }
        }
    }
}
