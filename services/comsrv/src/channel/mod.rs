//! Channel runtime
//!
//! One logical device session: lifecycle, poll scheduler, command queue,
//! reconnection and per-channel metrics. Each channel runs as one
//! cooperative task owning its transport, driver and point model.

pub mod backoff;
pub mod command;
pub mod runtime;
pub mod status;
pub mod subscriber;

pub use backoff::Backoff;
pub use command::{Command, CommandEnvelope, CommandStatusRecord, CommandValue};
pub use runtime::{spawn_channel, ChannelHandle, ChannelRuntimeConfig, CommandSubmitter};
pub use status::{ChannelMetrics, ChannelState, ChannelStatus};
pub use subscriber::spawn_command_subscriber;
