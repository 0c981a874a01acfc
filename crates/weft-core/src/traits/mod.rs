//! Core trait definitions

mod service;

pub use service::{Service, ServiceFactory, StatusReporter};
