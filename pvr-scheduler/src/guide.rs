//! Guide/listings provider.

use async_trait::async_trait;
use pvr_protocol::{Channel, ShowAiring};

use crate::database::{DatabaseHandle, Result};

/// Source of show airings consulted by the pending record resolver.
#[async_trait]
pub trait GuideProvider: Send + Sync {
    /// All airings of a series on a channel.
    async fn show_airings_by_channel_and_series_id(
        &self,
        channel: &Channel,
        series_id: &str,
    ) -> Result<Vec<ShowAiring>>;

    /// A single airing, used for ONCE rules.
    async fn show_airing(&self, show_id: &str) -> Result<Option<ShowAiring>>;
}

/// Guide backed by the local show cache.
#[derive(Clone)]
pub struct DatabaseGuide {
    database: DatabaseHandle,
}

impl DatabaseGuide {
    pub fn new(database: DatabaseHandle) -> Self {
        Self { database }
    }
}

#[async_trait]
impl GuideProvider for DatabaseGuide {
    async fn show_airings_by_channel_and_series_id(
        &self,
        channel: &Channel,
        series_id: &str,
    ) -> Result<Vec<ShowAiring>> {
        let db = self.database.lock().await;
        db.get_show_airings_by_channel_and_series_id(channel, series_id)
    }

    async fn show_airing(&self, show_id: &str) -> Result<Option<ShowAiring>> {
        let db = self.database.lock().await;
        db.get_show_airing(show_id)
    }
}
