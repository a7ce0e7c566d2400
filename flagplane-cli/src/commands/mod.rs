pub mod daemon;
pub mod flags;
pub mod resolve;
pub mod validate;
pub mod watch;
