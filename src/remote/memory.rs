//! In-process stand-in for the todo API
//!
//! Behaves like the real server (assigns ids and timestamps, 404s on unknown
//! ids) and adds knobs for tests and the offline demo: a reachability switch,
//! scripted per-operation failures, artificial latency and a call log.

use super::RemoteClient;
use crate::connectivity::ConnectivityProbe;
use crate::error::{Result, SyncError};
use crate::models::{Category, Item, NewItem};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

/// Remote operation, used for scripting failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    List,
    Create,
    Update,
    Delete,
    ListCategories,
}

/// One entry of the call log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    List,
    Create { title: String },
    Update { id: String },
    Delete { id: String },
    ListCategories,
}

impl RemoteCall {
    pub fn op(&self) -> RemoteOp {
        match self {
            RemoteCall::List => RemoteOp::List,
            RemoteCall::Create { .. } => RemoteOp::Create,
            RemoteCall::Update { .. } => RemoteOp::Update,
            RemoteCall::Delete { .. } => RemoteOp::Delete,
            RemoteCall::ListCategories => RemoteOp::ListCategories,
        }
    }
}

#[derive(Default)]
struct State {
    todos: Vec<Item>,
    categories: Vec<Category>,
    reachable: bool,
    failures: HashMap<RemoteOp, VecDeque<SyncError>>,
    assigned_ids: VecDeque<String>,
    next_id: u64,
    calls: Vec<RemoteCall>,
}

pub struct InMemoryRemote {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    /// Empty, reachable server
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                reachable: true,
                next_id: 1,
                ..Default::default()
            }),
            latency: None,
        }
    }

    /// Server pre-loaded with a couple of sample todos and categories
    pub fn with_demo_data() -> Self {
        let now = Utc::now();
        let yesterday = now - ChronoDuration::days(1);
        let remote = Self::new();
        remote.seed(vec![
            Item {
                id: "1".into(),
                title: "Welcome to your todo list!".into(),
                completed: false,
                created_at: now,
                updated_at: now,
            },
            Item {
                id: "2".into(),
                title: "This works offline too!".into(),
                completed: true,
                created_at: yesterday,
                updated_at: yesterday,
            },
        ]);
        remote.set_categories(vec![
            Category {
                id: "c1".into(),
                name: "Personal".into(),
            },
            Category {
                id: "c2".into(),
                name: "Work".into(),
            },
        ]);
        remote
    }

    /// Delay every call, so concurrent flushes can overlap in tests
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn seed(&self, items: Vec<Item>) {
        self.state.lock().todos = items;
    }

    pub fn set_categories(&self, categories: Vec<Category>) {
        self.state.lock().categories = categories;
    }

    /// When unreachable every call fails with `NetworkUnavailable`
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn is_reachable(&self) -> bool {
        self.state.lock().reachable
    }

    /// Make the next call of `op` fail with `error`; stacks in FIFO order
    pub fn fail_next(&self, op: RemoteOp, error: SyncError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Ids handed out by the next creates, before falling back to `srv-<n>`
    pub fn assign_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .assigned_ids
            .extend(ids.into_iter().map(Into::into));
    }

    /// Server-side contents
    pub fn items(&self) -> Vec<Item> {
        self.state.lock().todos.clone()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Log the call and decide whether it fails before touching data
    async fn begin(&self, call: RemoteCall) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        let op = call.op();
        debug!(?call, "remote call");
        state.calls.push(call);

        if !state.reachable {
            return Err(SyncError::NetworkUnavailable("Network unavailable".into()));
        }
        if let Some(error) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        Ok(())
    }
}

/// Reachability doubles as the connectivity answer
#[async_trait]
impl ConnectivityProbe for InMemoryRemote {
    async fn probe(&self) -> Option<bool> {
        Some(self.is_reachable())
    }
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn list(&self) -> Result<Vec<Item>> {
        self.begin(RemoteCall::List).await?;
        Ok(self.state.lock().todos.clone())
    }

    async fn create(&self, item: &NewItem) -> Result<Item> {
        self.begin(RemoteCall::Create {
            title: item.title.clone(),
        })
        .await?;

        let mut state = self.state.lock();
        let id = match state.assigned_ids.pop_front() {
            Some(id) => id,
            None => {
                let id = format!("srv-{}", state.next_id);
                state.next_id += 1;
                id
            }
        };
        let now = Utc::now();
        let created = Item {
            id,
            title: item.title.clone(),
            completed: item.completed,
            created_at: now,
            updated_at: now,
        };
        state.todos.push(created.clone());
        Ok(created)
    }

    async fn update(&self, item: &Item) -> Result<Item> {
        self.begin(RemoteCall::Update {
            id: item.id.clone(),
        })
        .await?;

        let mut state = self.state.lock();
        let slot = state
            .todos
            .iter_mut()
            .find(|t| t.id == item.id)
            .ok_or_else(|| SyncError::NotFound(format!("todo {}", item.id)))?;
        let mut updated = item.clone();
        updated.updated_at = Utc::now().max(updated.created_at);
        *slot = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.begin(RemoteCall::Delete { id: id.to_string() }).await?;

        let mut state = self.state.lock();
        let before = state.todos.len();
        state.todos.retain(|t| t.id != id);
        if state.todos.len() == before {
            return Err(SyncError::NotFound(format!("todo {}", id)));
        }
        Ok(())
    }

    async fn list_categories(&self) -> Result<Vec<Category>> {
        self.begin(RemoteCall::ListCategories).await?;
        Ok(self.state.lock().categories.clone())
    }
}
