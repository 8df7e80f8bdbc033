//! Exchange connectivity: REST client, ticker stream, and shared types.

pub mod gateway;
pub mod mock;
pub mod rest;
pub mod types;
pub mod websocket;

pub use gateway::ExchangeGateway;
pub use rest::OkxClient;
pub use types::*;
