//! Outbound webhook relay.
//!
//! Converts session events into the webhook wire format ([`payload`]) and
//! delivers them in timed batches with bounded retry ([`delivery`]).

pub mod delivery;
pub mod payload;

pub use delivery::{DeliveryOutcome, WebhookDeliveryService};
pub use payload::{Update, WebhookBody, WebhookEvent};
