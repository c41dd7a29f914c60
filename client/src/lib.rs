//! Birdlens realtime analysis client.
//!
//! Keeps a WebSocket link to the analysis service alive, submits audio for
//! species recognition, enriches the results from the eBird taxonomy,
//! records sightings on the backend and tracks which species are new this
//! session.

pub mod backend;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod ledger;
pub mod normalizer;
pub mod publisher;
pub mod session;
pub mod taxonomy;
pub mod transport;

pub use error::{ServiceError, SubmitError, TransportError};
pub use session::{AnalysisClient, ClientUpdate, UserSession};
