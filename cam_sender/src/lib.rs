pub mod sensors;

pub type Error = Box<dyn std::error::Error>;
