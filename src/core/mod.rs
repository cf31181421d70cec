pub mod domain;
pub mod pool;
pub mod protocol;
pub mod sandbox;
pub mod traits;
pub mod workers;
