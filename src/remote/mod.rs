//! Remote Client
//!
//! Stateless request functions against the todo API. Each call is an
//! independent network request; retries belong to the mutation queue.

pub mod http;
pub mod memory;

pub use http::HttpRemote;
pub use memory::InMemoryRemote;

use crate::error::Result;
use crate::models::{Category, Item, NewItem};
use async_trait::async_trait;

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// `GET /todos`
    async fn list(&self) -> Result<Vec<Item>>;

    /// `POST /todos`, returning the item with its server-assigned id
    async fn create(&self, item: &NewItem) -> Result<Item>;

    /// `PUT /todos/{id}`
    async fn update(&self, item: &Item) -> Result<Item>;

    /// `DELETE /todos/{id}`
    async fn delete(&self, id: &str) -> Result<()>;

    /// `GET /categories/minimal` (online only, never cached)
    async fn list_categories(&self) -> Result<Vec<Category>>;
}
