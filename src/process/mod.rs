pub mod wire;
pub mod worker;
