//! Flow assembly — turns a stream of decoded frames into per-connection
//! flow records with reassembled HTTP/TLS metadata, ready for the uplink
//! to batch and ship to the Hub.

pub mod id;
pub mod reassembly;
pub mod state;
pub mod table;

pub use id::{FlowId, FlowTuple};
pub use state::{Flow, FlowEvent, FlowStatus, ProtocolTag};
pub use table::FlowTable;
