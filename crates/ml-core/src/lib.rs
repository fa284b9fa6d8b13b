//! Detector boundary shared by the vision server.
//!
//! The server never depends on a concrete model: it talks to a [`Detector`]
//! and maps the raw class ids it returns through the [`classes`] table.

pub mod classes;
pub mod detector;
#[cfg(feature = "with-tch")]
pub mod torchscript;

pub use classes::{ObstacleClass, class_label};
pub use detector::{Detector, NullDetector, RawDetection};

#[cfg(feature = "with-tch")]
pub use tch;
