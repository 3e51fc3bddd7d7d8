pub mod client;
pub mod socket;

pub use client::PolygonClient;
pub use socket::PolygonConnector;
