pub mod backend;
pub mod config;
pub mod document;
pub mod error;
pub mod handle;
pub mod render;
pub mod stats;
pub mod target;
pub mod xps;
