use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TwitterUser {
    pub id: String,
    pub username: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ApiTweet {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// `GET /2/users/by` body. Unknown names land in `errors`, not `data`.
#[derive(Deserialize, Debug, Default)]
pub struct UsersResp {
    #[serde(default)]
    pub data: Option<Vec<TwitterUser>>,
    #[serde(default)]
    pub errors: Option<Vec<Value>>,
}

/// `GET /2/users/:id/tweets` body. `data` is absent when there is nothing new.
#[derive(Deserialize, Debug, Default)]
pub struct TweetsResp {
    #[serde(default)]
    pub data: Option<Vec<ApiTweet>>,
}
