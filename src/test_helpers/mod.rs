pub mod fake_device;
pub mod fixtures;
pub mod temp;
