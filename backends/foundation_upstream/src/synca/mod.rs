mod waitable;

pub use waitable::*;
