pub mod config;
pub mod db;
pub mod influencers;
pub mod medium;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod outbox;
pub mod scheduler;
pub mod telegram;
pub mod twitter;
