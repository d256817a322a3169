pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod traits;
pub mod types;

pub use config::HivemindConfig;
pub use error::{HivemindError, Result};
pub use event::{EventHub, HubEntry, StartFrom, Subscription};
pub use frame::{Channel, ControlFrame, ControlType, Frame, MetricFrame, TokenFrame};
pub use traits::{AgentRuntime, Tool, ToolInvoker};
pub use types::*;
