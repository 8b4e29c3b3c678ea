mod app;
pub mod error_sink;
pub mod loopback;
pub mod reporter;
pub mod settings;

// for main.rs
pub use app::run;
