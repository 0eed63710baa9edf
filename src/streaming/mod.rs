pub mod electrum;
pub mod engine;
pub mod runtime;
