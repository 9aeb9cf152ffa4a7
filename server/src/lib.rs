//! Server side of the sensor link: sessions, listeners and the data pipeline

mod dispatcher;
pub mod listeners;
pub mod pipeline;
pub mod server;

pub use server::{Server, ServerConfig, ServerHandle};
