pub mod connection;
pub mod handler;
pub mod info;
pub mod request;
pub mod response;
pub mod server;
