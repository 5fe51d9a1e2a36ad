//! HTTP handlers for the control plane's operator endpoints

pub mod control;

pub use control::{ControlState, InvalidateRequest, InvalidateResponse};
