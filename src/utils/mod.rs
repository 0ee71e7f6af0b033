pub mod atomic_write;
pub mod format;
pub mod sos;
