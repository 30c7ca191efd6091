//! # metahub-core
//!
//! Foundation types for the metahub message router.
//!
//! - [`Identity`] / [`Role`]: who is talking (`hub | env | agent | human`)
//! - [`Envelope`] / [`MessageType`]: the typed wire unit
//! - [`codec`]: strict, ordered validation of raw frames into envelopes
//! - [`errors`]: the error taxonomy every failure is reported through

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod identity;
pub mod message;

pub use errors::{BindingError, DeliveryError, HubError, RoutingError, ValidationError};
pub use identity::{Identity, Role};
pub use message::{Envelope, MessageType};
