//! Real-time rendering and coordination core for multi-strip WS281x LED
//! controllers: translates user intent from hardware input, a keyboard, and
//! a network API into a continuous stream of pixel frames delivered to
//! several GPIO-attached strips at a fixed target rate.
//!
//! Config loading, transport framing, individual animation algorithms,
//! GPIO driver internals, CLI parsing and logger setup are owned by callers;
//! this crate is the frame pipeline, animation/transition engines, event
//! bus, task registry and command boundary that sit between them.

pub mod animation;
pub mod color;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod frame;
pub mod ids;
pub mod mailbox;
pub mod pipeline;
pub mod registry;
pub mod snapshot;
pub mod static_controller;
pub mod strip_driver;
pub mod transition;
pub mod zone;
pub mod zone_service;

mod container;
pub use container::Container;
