pub mod api_types;
pub mod auth;
pub mod discovery;
pub mod host;
pub mod store;
