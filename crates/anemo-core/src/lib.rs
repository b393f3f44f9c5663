//! Hardware-independent core library for anemo-rs
//!
//! This crate contains the platform-agnostic logic of the ultrasonic
//! anemometer: a cooperative run-to-completion runtime (task queue, resource
//! lock, timers), the event-driven bus transaction layer, GPIO and interrupt
//! plumbing, the driver for the two time-of-flight transducer chips, and the
//! ranging pipeline that turns their raw waveforms into times of flight.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets and desktop hosts (for the simulator and tests). All
//! hardware access goes through the [`platform::Platform`] trait.

#![no_std]

extern crate alloc;

pub mod asic;
pub mod bus;
pub mod config;
pub mod gpio;
pub mod platform;
pub mod ranging;
pub mod runtime;
pub mod supervisor;
