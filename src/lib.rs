//! Integration engine for JVC Connected Cam camcorders.
//!
//! Discovers cameras on the local network, mirrors their parameters over
//! authenticated HTTP sessions, and bridges tally state between a tslumd
//! UMD listener, a line-oriented TCP command port and the cameras. UI and
//! MIDI collaborators consume the engine through [`engine::Engine`], the
//! parameter catalog in [`paramspec`] and the per-device observation API on
//! [`model::DeviceModel`].

pub mod app_config;
pub mod client;
pub mod config_store;
pub mod discovery;
pub mod domain;
pub mod engine;
pub mod model;
pub mod paramspec;
pub mod preview;
pub mod session;
pub mod tally;
