pub mod auth;
pub mod compactor;
pub mod engine;
pub mod limits;
pub mod mailer;
pub mod model;
pub mod notify;
pub mod observability;
pub mod tls;
pub mod wal;
pub mod wire;
