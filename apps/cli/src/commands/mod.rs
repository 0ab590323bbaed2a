//! Command implementations.

pub mod init;
pub mod status;
pub mod train;
