//! Leadpilot — multi-tenant lead-engagement engine for real-estate email.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod inbound;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod ratelimit;
pub mod respond;
pub mod store;
