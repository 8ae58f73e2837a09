//! # Trajectory-tracking MPC library.
//!
//! This library provides the model predictive control core used to keep a
//! vehicle on a locally fitted reference path. Each control cycle the host
//! passes in the current vehicle state and the polynomial coefficients of the
//! reference path, and gets back the actuation to command this tick plus the
//! predicted trajectory over the optimisation horizon.
//!
//! The host executable owns telemetry acquisition, waypoint frame transforms,
//! polynomial fitting and the communication layer. All modules in this crate
//! shall provide a public struct implementing the `module::State` trait.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

/// Utility maths functions - polynomial evaluation and clamping
pub mod maths;

/// Module interfaces - the init/proc contract all modules implement
pub mod module;

/// Generic parameters functions - TOML parameter file loading
pub mod params;

/// MPC control module - solves for the optimal actuation sequence each cycle
pub mod mpc_ctrl;
