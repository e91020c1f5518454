//! lanbench - zero-configuration LAN throughput measurement
//!
//! A server announces itself on the local network with periodic UDP
//! broadcast offers. Clients pick up an offer, request a payload of a chosen
//! size over any number of parallel TCP and UDP transfers, and report how
//! long each one took.
//!
//! # Library Usage
//!
//! ```ignore
//! use lanbench::{Client, ClientConfig};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::new(ClientConfig {
//!         file_size: 10 * 1024 * 1024,
//!         tcp_connections: 2,
//!         udp_connections: 1,
//!         rounds: Some(1),
//!         ..Default::default()
//!     });
//!
//!     let (tx, mut rx) = mpsc::channel(4);
//!     tokio::spawn(async move { client.run(tx).await });
//!
//!     while let Some(report) = rx.recv().await {
//!         println!("{}", lanbench::output::output_plain(&report));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`client`] - Offer discovery and transfer orchestration
//! - [`serve`] - Offer broadcaster and request dispatch
//! - [`protocol`] - Wire messages and their codec
//! - [`tcp`], [`udp`] - Transfer implementations
//! - [`net`] - Socket setup and port allocation
//! - [`stats`] - Transfer and round reports

pub mod client;
pub mod config;
pub mod net;
pub mod output;
pub mod protocol;
pub mod serve;
pub mod stats;
pub mod tcp;
pub mod udp;

pub use client::{Client, ClientConfig, ServerOffer};
pub use protocol::{Codec, DecodeError, Protocol, ProtocolConfig};
pub use serve::{Server, ServerConfig};
pub use stats::{RoundReport, TransferReport};
