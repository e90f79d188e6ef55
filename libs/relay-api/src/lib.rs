pub mod beacon;
pub mod error;
pub mod format;
pub mod record;
pub mod transport;
