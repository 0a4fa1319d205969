pub mod encoder;
pub mod lifecycle;
pub mod records;
pub mod retention;
pub mod runtime;
pub mod state;
pub mod trampoline;
