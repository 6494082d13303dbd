//! Client/server transport: 8-byte little-endian length-prefixed frames
//! over TCP, with query results serialized as JSON payloads.

mod client;
mod framing;
mod server;

pub use client::Client;
pub use framing::{read_frame, write_frame, MAX_CLIENT_MESSAGE};
pub use server::serve;
