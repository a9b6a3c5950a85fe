// Startup configuration
pub mod config;

// Persisted per-user credentials
pub mod credentials;

// Provider-facing OAuth exchanges
pub mod oauth;

// Token lifecycle state machine
pub mod lifecycle;

// HTTP API
pub mod api;
