//! Protocol clients bound to a connected server stream

pub mod client;
pub mod stdio;

pub use client::{ClientOptions, DocumentSelector, ProtocolClient, ProtocolClientFactory};
pub use stdio::StdioBridgeFactory;
