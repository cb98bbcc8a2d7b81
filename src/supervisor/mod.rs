//! Child-process supervision primitives shared by the platform supervisors.

pub mod child;

pub use child::{port_open, wait_for_port_close, ChildHandle, HelperKind};
