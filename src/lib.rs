//! Host side driver core for the Microchip CAN BUS Analyzer USB adapter.
#![deny(
    // missing_docs,
    // clippy::exhaustive_enums,
    // clippy::exhaustive_structs,
    clippy::all,
    clippy::correctness,
    clippy::perf,
    clippy::complexity,
    clippy::style,
    // clippy::pedantic,
    absolute_paths_not_starting_with_crate,
    rust_2021_incompatible_closure_captures,
    rust_2021_incompatible_or_patterns,
    rust_2021_prefixes_incompatible_syntax,
    rust_2021_prelude_collisions,
    clippy::clone_on_ref_ptr,
    clippy::else_if_without_else,
    clippy::exit,
    clippy::expect_used,
    clippy::get_unwrap,
    clippy::if_then_some_else_none,
    // clippy::indexing_slicing,
    // clippy::arithmetic_side_effects,
    clippy::shadow_unrelated,
    // clippy::unwrap_in_result,
    clippy::unwrap_used,
)]
#![cfg_attr(
    test,
    allow(
        clippy::indexing_slicing,
        unused_results,
        clippy::unwrap_used,
        clippy::unwrap_in_result,
        clippy::expect_used,
        clippy::as_conversions,
        clippy::shadow_unrelated,
        clippy::arithmetic_side_effects,
        clippy::let_underscore_untyped,
        clippy::pedantic,
        clippy::default_numeric_fallback,
        clippy::print_stderr,
    )
)]

pub mod adaptor;
mod config;
mod demux;
mod device;
pub mod protocol;
pub mod session;
#[cfg(test)]
mod tests;
mod utils;

pub use adaptor::{
    channel_pair, Channel, Completion, DriverError, Emulator, EmulatorConfig, Result,
    UsbTransport,
};
pub use config::DeviceConfig;
pub use demux::ReceiveDemux;
pub use device::{McbaDevice, McbaDeviceBuilder};
pub use protocol::{Bitrate, CanFrame, DeviceStats, DeviceStatus, ReceivedFrame};
pub use session::{CancelHandle, FileStats, ReadMode, ReadRequest, Session};
