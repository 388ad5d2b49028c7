pub mod engine;
pub mod session;
