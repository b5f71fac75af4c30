//! # idrecon - Identity Reconciliation
//!
//! idrecon links customer contact records that share an email address or a
//! phone number into a single identity. Each identity is a cluster anchored by
//! its oldest contact (the primary); every other contact in the cluster is a
//! secondary pointing at it.
//!
//! ## Core Concepts
//!
//! - **Contact**: one observed (email, phone) pair with timestamps and link state
//! - **Cluster Resolver**: merges every cluster an incoming pair touches under the oldest primary
//! - **Contact Store**: transactional storage; the resolver commits all of its changes or none
//! - **Identity Summary**: the de-duplicated, ordered view returned to callers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use idrecon::{IdentifyRequest, IdentityService, InMemoryContactStore};
//!
//! let service = IdentityService::new(Arc::new(InMemoryContactStore::new()));
//! let resp = service.identify(IdentifyRequest::new(
//!     Some("lorraine@hillvalley.edu"),
//!     Some("123456"),
//! ))?;
//! assert_eq!(resp.contact.emails, vec!["lorraine@hillvalley.edu"]);
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod clock;
pub mod config;
pub mod contact;
pub mod error;
pub mod request;
pub mod resolver;
pub mod response;
pub mod service;
pub mod storage;

#[cfg(feature = "transport-grpc")]
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ServiceConfig};
pub use contact::{Contact, ContactId, LinkPrecedence, LinkedContact, NewContact};
pub use error::{ErrorBody, ReconcileError, ReconcileResult, ValidationError};
pub use request::{IdentifyRequest, PhoneNumber};
pub use resolver::{select_winner, ClusterResolver, ContactKey, ReconcileOutcome, ResolvedCluster};
pub use response::{build_response, IdentifyResponse, IdentitySummary};
pub use service::{Cancellation, IdentityService};
pub use storage::{ContactStore, ContactTransaction, InMemoryContactStore, StorageError};
