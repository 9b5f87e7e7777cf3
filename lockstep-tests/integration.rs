//! Integration tests for Lockstep
//!
//! Simulated engines driven by the scheduler through every transport:
//! multi-rate stepping, routing of devices nobody else asked for, device
//! identity on the wire and the ways a run is aborted.

#[path = "integration/support.rs"]
mod support;

#[path = "integration/multi_rate.rs"]
mod multi_rate;

#[path = "integration/foreign_device.rs"]
mod foreign_device;

#[path = "integration/device_identity.rs"]
mod device_identity;

#[path = "integration/fail_fast.rs"]
mod fail_fast;

#[path = "integration/step_properties.rs"]
mod step_properties;
