//! campus-server: HTTP backend for a community of international students.
//!
//! Posts, categories, comments, likes, direct messages with an AI assistant,
//! notifications, image uploads, and AI content generation, persisted in
//! SQLite.

pub mod auth;
pub mod chat_service;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod ids;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod web;
