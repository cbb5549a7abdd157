//! Host-application collaborator traits.
//!
//! The engine never parses host-specific wire formats. Embedding
//! applications implement these traits against their own endpoints and hand
//! the trait objects to the built-in jobs; every record type here is already
//! shaped for direct conversion into an
//! [`IndexItem`](crate::models::IndexItem).

use anyhow::Result;
use async_trait::async_trait;

/// One page of feed entry headers.
#[derive(Debug, Clone)]
pub struct FeedPage {
    pub entries: Vec<FeedEntry>,
    pub has_more: bool,
}

/// A feed entry header; the body is fetched separately per entry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FeedEntry {
    pub id: String,
    pub subject: String,
    pub author: String,
    /// Epoch milliseconds.
    pub date: i64,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub read: bool,
}

/// A paginated message-style feed, newest first.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// List entry headers starting at `offset`.
    async fn list(&self, offset: usize, limit: usize) -> Result<FeedPage>;

    /// Fetch the plain-text body of one entry.
    async fn content(&self, id: &str) -> Result<String>;
}

/// A short-lived announcement.
#[derive(Debug, Clone)]
pub struct Bulletin {
    pub id: String,
    pub title: String,
    pub body: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub author: Option<String>,
}

/// A flat list of recent announcements.
#[async_trait]
pub trait BulletinSource: Send + Sync {
    async fn bulletins(&self) -> Result<Vec<Bulletin>>;
}

/// A unit of upcoming or past work.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub subject: String,
    pub description: String,
    /// Due date in epoch milliseconds, when the host provides one.
    pub due: Option<i64>,
    pub submitted: bool,
}

/// Upcoming and historical work items.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn upcoming(&self) -> Result<Vec<TaskRecord>>;
    async fn past(&self) -> Result<Vec<TaskRecord>>;
}

/// A catalog entry (subject, area, channel — whatever the host organizes
/// content by).
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub id: String,
    pub code: String,
    pub title: String,
    pub description: String,
}

/// The host's content catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn entries(&self) -> Result<Vec<CatalogEntry>>;
}
