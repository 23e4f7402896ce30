//! # pulselink-engine
//!
//! Backend engine for PulseLink wearable biosensor bands: device
//! session management, the real-time DSP pipelines, the WebSocket
//! fan-out bus, and the session recorder.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use pulselink_engine::{
//!     api, bus::WsBus, config::EngineConfig, device::link::Link,
//!     device::sim::{SimLink, SimScript}, engine::Engine,
//!     recorder::store::SessionStore,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> pulselink_engine::EngineResult<()> {
//!     let config = EngineConfig::discover(None)?;
//!     let store = Arc::new(SessionStore::open(config.db_path())?);
//!     let bus = WsBus::new(
//!         config.client_send_queue_len,
//!         config.slow_consumer_lag_threshold,
//!     );
//!     let cancel = CancellationToken::new();
//!     let link = Link::Sim(SimLink::new(Arc::new(SimScript::default())));
//!     let (engine, recorder, _task) =
//!         Engine::spawn(config, link, Arc::clone(&store), bus.clone(), cancel)?;
//!     let _ = engine.scan(None).await?;
//!     let _ = (recorder, bus);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Device ──raw batches──▶ Ring Buffers ──▶ DSP Pipelines
//!    │                                        │
//!    │                          processed windows
//!    ▼                                        ▼
//! Session Recorder ◀──────────────── WebSocket Bus ──▶ clients
//!                    ▲
//!           Engine Coordinator ◀── HTTP control plane
//! ```

pub mod api;
pub mod bus;
pub mod config;
pub mod device;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod recorder;
pub mod ring;
pub mod sample;

// ─── Public re-exports ──────────────────────────────────────────────

pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle, EngineStatus};
pub use error::{EngineError, EngineResult, ErrorCode};
pub use sample::SensorKind;
