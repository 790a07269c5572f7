//! Modbus TCP gateway polling service
//!
//! Polls the slaves behind a set of Modbus TCP gateways on a fixed cadence
//! and accepts on-demand reads and writes.
//!
//! ```text
//! ┌──────────────┐   ┌─────────────────┐   ┌─────────────────────┐
//! │ AppConfig    │──►│ GatewayRegistry │──►│ ConnectionManager   │── TCP ──► gateways
//! │ (YAML + env) │   │ (validated)     │   │ (worker per gateway)│
//! └──────────────┘   └─────────────────┘   └──────────┬──────────┘
//!                                                     │ frames / state
//!                    ┌─────────────────┐   ┌──────────▼──────────┐
//!                    │ ResultSink      │◄──│ Scheduler           │
//!                    │ HealthRegistry  │   │ (poller per gateway)│
//!                    └─────────────────┘   └─────────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod sink;

pub use config::{AppConfig, GatewayConfig, RegisterGroup};
pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState};
pub use error::{GwError, Result};
pub use health::{GatewayHealth, HealthRegistry, SlaveHealth};
pub use registry::{Gateway, GatewayId, GatewayRegistry};
pub use scheduler::{PollSettings, Scheduler, SchedulerHandle};
pub use service::GatewayService;
pub use sink::{ChannelSink, LoggingSink, PollResult, ResultSink};
