pub mod client;
pub mod crypto;
pub mod models;
pub mod peer;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod tls;
pub mod transfer;
pub mod wire;
