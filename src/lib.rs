pub mod auth;
pub mod backend;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod kv;
pub mod logging;
pub mod model;
pub mod remote;
pub mod store;
pub mod summary;
pub mod sync;
pub mod vault;
