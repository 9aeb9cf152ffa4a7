//! Code shared between the server and the client side of the sensor link

pub mod codec;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod ring_buffer;
pub mod types;
