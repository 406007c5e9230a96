pub mod network;
pub mod ports;
