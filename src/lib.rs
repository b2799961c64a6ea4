//! Assigns decoded packets to directional flows keyed on the 5-tuple plus VLAN, and emits a
//! record per flow when it ends by TCP termination, active or idle timeout, capacity pressure or
//! the end of the capture.

pub mod banner;
pub mod cache;
pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod key;
pub mod output;
pub mod packet;
pub mod pipeline;
pub mod queue;
pub mod record;

pub use config::{Config, FinPolicy};
pub use engine::{EngineStats, FlowEngine, FlowSink, Verdict};
pub use error::{Error, Result};
pub use key::FlowKey;
pub use packet::MetaPacket;
pub use record::{ClosureReason, FirstPayload, Flow};
