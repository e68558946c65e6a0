//! Access token issued through a developer key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::developer_key::DeveloperKeyId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: i64,
    pub developer_key_id: DeveloperKeyId,
    pub user_id: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AccessToken {
    /// Create an unsaved token. The store assigns the id.
    pub fn new(developer_key_id: DeveloperKeyId, user_id: i64) -> Self {
        Self {
            id: 0,
            developer_key_id,
            user_id,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn used_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_used_at = Some(at);
        self
    }
}
