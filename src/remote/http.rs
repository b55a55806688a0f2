//! HTTP client for the todo REST API

use super::RemoteClient;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::models::{Category, Item, NewItem};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

pub struct HttpRemote {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self::new(&config.remote.base_url, config.request_timeout())?
            .with_auth_token(config.remote.auth_token.clone()))
    }

    /// Bearer token for the category listing
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn todos_url(&self) -> String {
        format!("{}/todos", self.base_url)
    }

    fn todo_url(&self, id: &str) -> String {
        format!("{}/todos/{}", self.base_url, id)
    }
}

/// Map a non-success status to the error taxonomy
async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(SyncError::NotFound(what.to_string()));
    }
    Err(SyncError::RequestFailed {
        status: Some(status.as_u16()),
        message: response.text().await.unwrap_or_default(),
    })
}

async fn json_body<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let response = check_status(response, what).await?;
    Ok(response.json().await?)
}

#[async_trait]
impl RemoteClient for HttpRemote {
    async fn list(&self) -> Result<Vec<Item>> {
        let response = self.client.get(self.todos_url()).send().await?;
        let items: Vec<Item> = json_body(response, "todos").await?;
        debug!(count = items.len(), "listed remote todos");
        Ok(items)
    }

    async fn create(&self, item: &NewItem) -> Result<Item> {
        let response = self.client.post(self.todos_url()).json(item).send().await?;
        json_body(response, "todos").await
    }

    async fn update(&self, item: &Item) -> Result<Item> {
        let response = self
            .client
            .put(self.todo_url(&item.id))
            .json(item)
            .send()
            .await?;
        json_body(response, &format!("todo {}", item.id)).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let response = self.client.delete(self.todo_url(id)).send().await?;
        check_status(response, &format!("todo {}", id)).await?;
        Ok(())
    }

    async fn list_categories(&self) -> Result<Vec<Category>> {
        let mut request = self
            .client
            .get(format!("{}/categories/minimal", self.base_url));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        json_body(request.send().await?, "categories").await
    }
}
