//! Security subsystems

pub mod mac;
