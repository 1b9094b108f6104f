//! Venue boundary: value types, the gateway trait, and a paper venue.

pub mod paper;
pub mod traits;
pub mod types;

pub use paper::{PaperVenue, PriceWalk};
pub use traits::{VenueError, VenueGateway};
pub use types::*;

#[cfg(test)]
pub use traits::MockVenueGateway;
