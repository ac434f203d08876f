//! Rclone integration module
//!
//! Provides functionality for:
//! - Running and launching rclone processes
//! - Parsing rclone's streaming progress output
//! - Mounting remotes as local filesystems

pub mod mount;
pub mod parser;
pub mod process;

pub use mount::{MountManager, MountOptions};
pub use process::{RcloneOutput, RcloneRunner};
