pub mod clock;
pub mod config;
pub mod conversation;
pub mod engage;
pub mod events;
pub mod gifs;
pub mod http_client;
pub mod inbound;
pub mod llm_client;
pub mod memory;
pub mod message;
pub mod profiles;
pub mod responder;
pub mod runtime;
pub mod server;
pub mod stats;
pub mod task;
pub mod transport;

#[cfg(test)]
mod testing;
