//! Asynchronous driver for the PN532 contactless reader IC over its HSU (UART) transport.
//!
//! The crate is split the way the protocol itself is layered: [`frame`] builds and parses the
//! PN532 normal information frame, [`pn532`] drives one command/response exchange on top of a
//! byte-oriented UART, [`controller`] turns that into typed operations (init, detect, transceive,
//! check-present, release), and [`reader`] runs the tag-lifecycle state machine and exposes the
//! host-facing API.
//!
//! Typical usage: build a [`controller::Controller`] from a UART and a reset pin, place a
//! `static` [`reader::Shared`] for it, split the two with [`reader::new`], spawn the resulting
//! [`reader::Runner`] as a task in your own executor, and use the [`reader::Reader`] handle to
//! subscribe to tag events or exchange APDUs.
#![no_std]

pub mod config;
pub mod controller;
pub mod error;
pub mod frame;
pub mod pn532;
pub mod reader;
pub mod tag;

pub use config::ReaderConfig;
pub use controller::Controller;
pub use error::Error;
pub use reader::{Event, Reader, Runner};
pub use tag::TagInfo;
