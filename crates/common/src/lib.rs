pub mod config;
pub mod db;
pub mod leaderboard;
pub mod observability;
pub mod types;
