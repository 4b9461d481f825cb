pub mod api_rules;
pub mod postgres_store;
pub mod webhook;
