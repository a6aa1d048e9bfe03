pub mod format;
pub(crate) mod isolate;
pub(crate) mod lock;
