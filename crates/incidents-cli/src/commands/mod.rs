pub mod attach;
pub mod auth;
pub mod common;
pub mod config;
pub mod create;
pub mod delete;
pub mod edit;
pub mod list;
pub mod resolve;
pub mod retry;
pub mod show;
pub mod status;
pub mod sync;
