//! Inventory service trait and in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::ServiceError;
use crate::models::OrderItem;

/// Product the in-memory service always reports as out of stock.
pub const UNAVAILABLE_PRODUCT: &str = "prod-unavailable";

/// Stock reservation operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves every item of an order and returns the reservation id.
    /// Reserving the same order twice returns the existing reservation.
    async fn reserve(&self, order_id: &str, items: &[OrderItem]) -> Result<String, ServiceError>;

    /// Releases a reservation. Unknown ids are ignored.
    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug)]
struct InventoryState {
    unavailable: HashSet<String>,
    reservations: HashMap<String, (String, Vec<OrderItem>)>,
    released: Vec<String>,
    next_id: u32,
}

/// In-memory inventory service for tests and the demo binary.
#[derive(Debug, Clone)]
pub struct InMemoryInventoryService {
    state: Arc<Mutex<InventoryState>>,
}

impl Default for InMemoryInventoryService {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(InventoryState {
                unavailable: HashSet::from([UNAVAILABLE_PRODUCT.to_string()]),
                reservations: HashMap::new(),
                released: Vec::new(),
                next_id: 0,
            })),
        }
    }
}

impl InMemoryInventoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `product_id` as out of stock from now on.
    pub async fn mark_unavailable(&self, product_id: &str) {
        self.state
            .lock()
            .await
            .unavailable
            .insert(product_id.to_string());
    }

    /// Returns the number of active reservations.
    pub async fn reservation_count(&self) -> usize {
        self.state.lock().await.reservations.len()
    }

    pub async fn released(&self) -> Vec<String> {
        self.state.lock().await.released.clone()
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(&self, order_id: &str, items: &[OrderItem]) -> Result<String, ServiceError> {
        let mut state = self.state.lock().await;
        if let Some(item) = items
            .iter()
            .find(|item| state.unavailable.contains(&item.product_id))
        {
            return Err(ServiceError::OutOfStock {
                product_id: item.product_id.clone(),
            });
        }

        let existing = state
            .reservations
            .iter()
            .find(|(_, (order, _))| order == order_id)
            .map(|(id, _)| id.clone());
        if let Some(reservation_id) = existing {
            return Ok(reservation_id);
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(reservation_id.clone(), (order_id.to_string(), items.to_vec()));
        Ok(reservation_id)
    }

    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        if state.reservations.remove(reservation_id).is_some() {
            state.released.push(reservation_id.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Vec<OrderItem> {
        vec![OrderItem::new("prod-001", 2, 29.99)]
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let service = InMemoryInventoryService::new();

        let reservation = service.reserve("order-1", &items()).await.unwrap();
        assert_eq!(reservation, "RES-0001");
        assert_eq!(service.reservation_count().await, 1);

        service.release(&reservation).await.unwrap();
        assert_eq!(service.reservation_count().await, 0);
        assert_eq!(service.released().await, vec![reservation]);
    }

    #[tokio::test]
    async fn test_reserve_is_idempotent_per_order() {
        let service = InMemoryInventoryService::new();
        let first = service.reserve("order-1", &items()).await.unwrap();
        let second = service.reserve("order-1", &items()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(service.reservation_count().await, 1);
    }

    #[tokio::test]
    async fn test_unavailable_product_fails() {
        let service = InMemoryInventoryService::new();
        let mut order_items = items();
        order_items.push(OrderItem::new(UNAVAILABLE_PRODUCT, 1, 5.0));

        let result = service.reserve("order-1", &order_items).await;
        assert!(matches!(
            result,
            Err(ServiceError::OutOfStock { ref product_id }) if product_id == UNAVAILABLE_PRODUCT
        ));
        assert_eq!(service.reservation_count().await, 0);

        service.mark_unavailable("prod-001").await;
        assert!(service.reserve("order-2", &items()).await.is_err());
    }
}
