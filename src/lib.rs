pub mod audio;
pub mod config;
pub mod error;
pub mod live;
pub mod net;
pub mod session;
pub mod speech;
