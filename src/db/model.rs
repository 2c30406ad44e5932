//! Read models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

/// Calls made with one bearer token during a month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenUsage {
    pub token_index: usize,
    pub calls: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerCount {
    pub manager: String,
    pub count: i64,
}

/// Snapshot rendered by the `/stats` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub influencers: i64,
    pub cached_user_ids: i64,
    pub assignments: Vec<ManagerCount>,
    pub token_usage: Vec<TokenUsage>,
    pub pending_deliveries: i64,
}
