//! Batched delivery of transformed records to a remote indexing service.
//!
//! The [`BatchDeliverySink`] groups accepted records into batches and posts
//! each batch as a JSON array through a [`DeliveryClient`]. The update path
//! is either configured or detected once per sink by [`UpdateEndpoint`].

mod client;
mod endpoint;
mod sink;


#[cfg(test)]
pub use client::MockDeliveryClient;
pub use client::{DeliveryClient, DeliveryResponse};
#[cfg(feature = "http")]
pub use client::HttpDeliveryClient;
pub use endpoint::{UpdateEndpoint, FALLBACK_UPDATE_PATH, PRIMARY_UPDATE_PATH};
pub use sink::{BatchDeliverySink, SinkState};
