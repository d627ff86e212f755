//! Rental order types and the in-memory order book.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use super::transitions::StateMachine;

/// State of a rental order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    /// Created, waiting for a GPU.
    Pending,
    /// A GPU is reserved for the renter.
    Matched,
    /// Paid and running.
    Active,
    /// Finished normally.
    Completed,
    /// Cancelled before completion.
    Cancelled,
}

/// A request to rent GPU time, as received from the API layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RentRequest {
    /// Renter.
    pub user_id: String,
    /// Specific GPU asked for, if any.
    #[serde(default)]
    pub gpu_id: Option<String>,
    /// Price per hour.
    pub rate: f64,
    /// Rental length in hours.
    pub duration_hours: u32,
}

/// A rental order referencing one GPU.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RentalOrder {
    /// Order identifier.
    pub id: String,
    /// Renter.
    pub user_id: String,
    /// GPU referenced by the order, set once matched (or preset on request).
    #[serde(default)]
    pub gpu_id: Option<String>,
    /// Current state.
    pub state: OrderState,
    /// When the order was created.
    pub created_at: DateTime<Utc>,
    /// When the order last changed.
    pub updated_at: DateTime<Utc>,
    /// Price per hour.
    pub rate: f64,
    /// Rental length in hours.
    pub duration_hours: u32,
}

impl RentRequest {
    /// Creates a request for any available GPU.
    #[must_use]
    pub fn new(user_id: impl Into<String>, rate: f64, duration_hours: u32) -> Self {
        Self {
            user_id: user_id.into(),
            gpu_id: None,
            rate,
            duration_hours,
        }
    }

    /// Pins the request to a specific GPU.
    #[must_use]
    pub fn for_gpu(mut self, gpu_id: impl Into<String>) -> Self {
        self.gpu_id = Some(gpu_id.into());
        self
    }
}

impl RentalOrder {
    /// Creates a pending order from a request.
    #[must_use]
    pub fn new(request: RentRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id,
            gpu_id: request.gpu_id,
            state: OrderState::Pending,
            created_at: now,
            updated_at: now,
            rate: request.rate,
            duration_hours: request.duration_hours,
        }
    }

    /// Total price of the rental.
    #[must_use]
    pub fn total_cost(&self) -> f64 {
        self.rate * f64::from(self.duration_hours)
    }

    /// Returns true if the order can still change state.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Returns true if the order currently holds its GPU.
    #[must_use]
    pub const fn holds_gpu(&self) -> bool {
        matches!(self.state, OrderState::Matched | OrderState::Active)
    }
}

/// In-memory order storage.
#[derive(Debug, Default)]
pub(crate) struct OrderBook {
    orders: HashMap<String, RentalOrder>,
}

impl OrderBook {
    pub(crate) fn insert(&mut self, order: RentalOrder) {
        self.orders.insert(order.id.clone(), order);
    }

    pub(crate) fn get(&self, order_id: &str) -> Option<&RentalOrder> {
        self.orders.get(order_id)
    }

    pub(crate) fn get_mut(&mut self, order_id: &str) -> Option<&mut RentalOrder> {
        self.orders.get_mut(order_id)
    }

    /// Orders sorted by creation time, optionally filtered by renter.
    pub(crate) fn list(&self, user_id: Option<&str>) -> Vec<RentalOrder> {
        let mut orders: Vec<RentalOrder> = self
            .orders
            .values()
            .filter(|o| user_id.is_none_or(|u| o.user_id == u))
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        orders
    }

    /// The order currently holding `gpu_id`, if any.
    pub(crate) fn holder_of(&self, gpu_id: &str) -> Option<&RentalOrder> {
        self.orders
            .values()
            .find(|o| o.holds_gpu() && o.gpu_id.as_deref() == Some(gpu_id))
    }

    /// An open order that names `gpu_id`, matched or not.
    pub(crate) fn open_referencing(&self, gpu_id: &str) -> Option<&RentalOrder> {
        self.orders
            .values()
            .find(|o| o.is_open() && o.gpu_id.as_deref() == Some(gpu_id))
    }

    /// Ids of every order currently holding a GPU.
    pub(crate) fn holding_ids(&self) -> Vec<String> {
        self.orders
            .values()
            .filter(|o| o.holds_gpu())
            .map(|o| o.id.clone())
            .collect()
    }

    pub(crate) fn replace_all(&mut self, orders: Vec<RentalOrder>) {
        self.orders = orders.into_iter().map(|o| (o.id.clone(), o)).collect();
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Pending => "pending",
            Self::Matched => "matched",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{state}")
    }
}

impl FromStr for OrderState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "matched" => Ok(Self::Matched),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("unknown order state: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_order_is_pending() {
        let order = RentalOrder::new(RentRequest::new("alice", 0.5, 4), Utc::now());
        assert_eq!(order.state, OrderState::Pending);
        assert!(order.is_open());
        assert!(!order.holds_gpu());
        assert!((order.total_cost() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_order_ids_unique() {
        let now = Utc::now();
        let a = RentalOrder::new(RentRequest::new("alice", 1.0, 1), now);
        let b = RentalOrder::new(RentRequest::new("alice", 1.0, 1), now);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_book_list_filters_by_user() {
        let now = Utc::now();
        let mut book = OrderBook::default();
        book.insert(RentalOrder::new(RentRequest::new("alice", 1.0, 1), now));
        book.insert(RentalOrder::new(RentRequest::new("bob", 1.0, 1), now));

        assert_eq!(book.list(None).len(), 2);
        assert_eq!(book.list(Some("bob")).len(), 1);
        assert!(book.list(Some("carol")).is_empty());
    }

    #[test]
    fn test_holder_of() {
        let now = Utc::now();
        let mut book = OrderBook::default();
        let mut order = RentalOrder::new(RentRequest::new("alice", 1.0, 1).for_gpu("g1"), now);
        let id = order.id.clone();
        book.insert(order.clone());
        assert!(book.holder_of("g1").is_none());
        assert!(book.open_referencing("g1").is_some());
        assert!(book.open_referencing("g2").is_none());

        order.state = OrderState::Matched;
        book.insert(order);
        assert_eq!(book.holder_of("g1").map(|o| o.id.as_str()), Some(id.as_str()));
        assert_eq!(book.holding_ids(), vec![id]);
    }
}
