pub mod conditioner;
pub mod config;
pub mod coordinator;
pub mod data_logger;
pub mod detector;
pub mod dsp;
pub mod firmata;
pub mod mapper;
pub mod osc_sender;
pub mod simulator;
pub mod sink;
pub mod source;
pub mod types;
pub mod window;
pub mod worker;

#[cfg(feature = "hardware")]
pub mod serial_reader;
