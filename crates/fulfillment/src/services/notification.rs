//! Customer notification trait and in-memory implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::ServiceError;
use crate::models::NotificationRequest;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, request: &NotificationRequest) -> Result<(), ServiceError>;
}

/// Records sent notifications instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    sent: Arc<Mutex<Vec<NotificationRequest>>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn send(&self, request: &NotificationRequest) -> Result<(), ServiceError> {
        self.sent.lock().await.push(request.clone());
        Ok(())
    }
}
