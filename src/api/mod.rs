//! REST transport for the catalog backend.
//!
//! Maps brands, types and headphones onto list/create/update/delete
//! endpoints and classifies failures for the cache's retry policy.

mod client;
mod error;
mod types;

pub use client::ApiClient;
pub use error::{ApiError, Operation, RequestContext};
pub use types::{Brand, Headphone, HeadphoneInput, HeadphoneType, NameInput, Resource, WriteInput};
