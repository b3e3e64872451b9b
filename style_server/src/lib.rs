//! Real-time neural style transfer on a camera stream.
//!
//! Frames arrive on the data socket, a timer in [`driver`] stylizes the
//! latest one with the active style and the HTTP [`endpoints`] stream the
//! result and switch styles.
pub mod capture;
pub mod config;
pub mod data_socket;
pub mod driver;
pub mod endpoints;
pub mod meter;
pub mod nn;
pub mod render;
pub mod resources;
pub mod selection;
pub mod style;
pub mod stylize;
pub mod utils;
