//! Flow tracking and UDP relaying for the hop tunnel data plane
//!
//! - [`NatTable`]: maps local flows to 16-bit NAT ids and back
//! - [`RelayPool`]: forwards tunneled UDP flows to their real destinations
//!   through per-flow sockets and hands replies back
//!
//! Both key flows either on the source alone ([`KeyingMode::Basic`]) or on
//! source and destination ([`KeyingMode::Extended`]).
//!
//! # Example
//!
//! ```
//! use hop_nat::{FlowKey, FlowProtocol, KeyingMode, NatTable};
//!
//! let table = NatTable::new(KeyingMode::Basic);
//! let flow = FlowKey::new(
//!     FlowProtocol::Udp,
//!     "10.0.0.2:5000".parse().unwrap(),
//!     "8.8.8.8:53".parse().unwrap(),
//! );
//!
//! let entry = table.get_or_add(&flow).unwrap();
//! assert_eq!(table.get_or_add(&flow).unwrap().nat_id, entry.nat_id);
//! ```

mod error;
mod flow;
pub mod packet;
mod relay;
mod table;

pub use error::{Error, Result};
pub use flow::{FlowKey, FlowProtocol, IpVersion, KeyingMode};
pub use relay::{RelayConfig, RelayKey, RelayPool, RelayReply, RelayStats};
pub use table::{NatEntry, NatTable, NatTimeouts, MAX_NAT_ID, MIN_NAT_ID};
