//! Multi-channel industrial-protocol communication server
//!
//! Owns a set of device connections, translates configured point tables
//! into protocol transactions, polls device values on a schedule, and
//! publishes decoded samples into the shared realtime store that the
//! historian, model engine and alarm engine consume. Outbound setpoint and
//! control commands travel the reverse path.
//!
//! Layering, leaves first: [`transport`] carries bytes, [`protocol`]
//! frames and correlates transactions, [`points`] maps addresses to typed
//! values, [`channel`] schedules one device session, [`publisher`] writes
//! samples out, and [`supervisor`] owns the set of channels.

pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod points;
pub mod protocol;
pub mod publisher;
pub mod supervisor;
pub mod transport;

pub use config::AppConfig;
pub use error::{ComSrvError, Result};
pub use publisher::{Publisher, PublisherConfig};
pub use supervisor::Supervisor;
