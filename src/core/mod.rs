//! The monitoring pipeline.
//!
//! ```text
//! Sampler -> Classifier -> StateBuffer -> PersistenceGate -> DeliveryManager -> broker
//!                                                                |
//!                                                          OfflineQueue
//! ```
//!
//! [`executor::Executor`] drives everything up to the gate on one task;
//! [`delivery::DeliveryManager`] runs on its own. [`network::NetworkMonitor`]
//! steers the broker session from the side.

pub mod calibration;
pub mod classifier;
pub mod delivery;
pub mod error;
pub mod event;
pub mod executor;
pub mod gate;
pub mod network;
pub mod queue;
pub mod sampler;
pub mod stability;
