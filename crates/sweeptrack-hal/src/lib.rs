//! `sweeptrack-hal` – Hardware Abstraction Layer.
//!
//! Defines the traits every device transport implements and ships the
//! in-process drivers used for tests and headless runs.
//!
//! # Modules
//!
//! - [`source`] – [`SweepSource`][source::SweepSource]: bounded-wait frame
//!   reader, plus the channel-backed [`ChannelSource`][source::ChannelSource].
//! - [`driver`] – [`Driver`][driver::Driver]: device enumeration and opening.
//! - [`controller`] – [`ButtonTracker`][controller::ButtonTracker]: button
//!   edge detection.
//! - [`sim`] – [`SimDriver`][sim::SimDriver]: simulated lighthouse devices
//!   with fault injection.

pub mod controller;
pub mod driver;
pub mod sim;
pub mod source;
