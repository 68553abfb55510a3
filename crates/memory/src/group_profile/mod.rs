//! Group profile extraction
//!
//! Two analyses run in parallel over one batch: content analysis produces
//! the subject, summary and topics; behavior analysis assigns roles from a
//! closed set. Both merge incrementally into the existing profile with
//! evidence validation against the batch.

pub mod analysis;
pub mod roles;
pub mod topics;

pub use analysis::{GroupProfileExtractRequest, GroupProfileExtractor};
