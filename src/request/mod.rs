//! Request context adapter.

mod context;

pub use context::{adapt, AdapterOptions, RequestContext};
