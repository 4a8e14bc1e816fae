//! # Laser Calibration Core Library
//!
//! Core library for the `laser_cal` application: automated laser-power
//! calibration for a multi-rack print engine. The numeric controller runs
//! the physical sequence (gantry motion, firing, interlocks); this
//! application mirrors the controller's tag catalog, answers its per-pixel
//! commands, measures delivered power with an external meter, and turns the
//! measurements into firmware correction LUTs.
//!
//! ## Crate Structure
//!
//! - **`tags`**: the fixed controller tag catalog, the value type carried by
//!   tags, the protocol seam (`PlcClient`), and the subscribed-tag mirror
//!   registry with its single-threaded reaction loop.
//! - **`config`**: immutable per-session settings loaded from layered TOML,
//!   plus the controller-resolved machine identity.
//! - **`error`**: the `CalError` taxonomy shared across the crate.
//! - **`instrument`**: the power-meter seam and its scripted mock.
//! - **`pixel`**: the pixel-to-(rack, laser) channel map.
//! - **`orchestrator`**: run configuration, the command/acknowledge
//!   handshake machines, pulse buffers, tolerance classification, and the
//!   event loop that drives one test run.
//! - **`calib`**: curve fitting, LUT scaling/clamping, and blob encoding.
//! - **`export`**: the CSV artifacts written per run.
//! - **`upload`**: LUT transfer to the rack controllers.
//! - **`telemetry`**: periodic optics-box sampling during a run.
//! - **`sim`**: a scripted controller for simulation mode and tests.

pub mod calib;
pub mod config;
pub mod error;
pub mod export;
pub mod instrument;
pub mod orchestrator;
pub mod pixel;
pub mod sim;
pub mod tags;
pub mod telemetry;
pub mod upload;
