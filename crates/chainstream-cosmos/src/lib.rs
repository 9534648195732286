//! chainstream-cosmos — CometBFT / Tendermint node source.
//!
//! | Query | Endpoint |
//! |---|---|
//! | latest height | `GET /status` |
//! | block | `GET /block?height=` |
//! | block results | `GET /block_results?height=` |
//! | block metas | `GET /blockchain?minHeight=&maxHeight=` |
//! | new blocks | websocket `subscribe` to `tm.event='NewBlock'` |
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainstream_cosmos::{CometConfig, CometNode};
//!
//! let node = Arc::new(CometNode::new(CometConfig::new("http://localhost:26657")).unwrap());
//! ```

pub mod client;
pub mod rpc;
pub mod ws;

pub use client::{CometConfig, CometNode, MAX_BLOCKCHAIN_RANGE};
