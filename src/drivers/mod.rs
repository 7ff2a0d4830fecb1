//! Fan backend implementations.

pub mod file_fan;
pub mod hwmon;

pub use file_fan::FileFan;
pub use hwmon::HwMonFan;
