//! Protocol descriptors, connection parameters and `.manager` manifests.
//!
//! This crate describes *what* a connection manager offers before any
//! connection exists:
//! - [`ProtocolDescriptor`]: parameters, interfaces, channel classes,
//!   avatar requirements and authentication types of one protocol
//! - [`Parameter`] / [`ParamFlags`]: the `(name, flags, signature, default)`
//!   tuples, plus [`validate_parameters`] for checking a connection request
//! - [`Manifest`]: reading, writing and locating manifest files

pub mod descriptor;
pub mod error;
mod keyfile;
pub mod manifest;
pub mod param;

pub use descriptor::{AvatarRequirements, ProtocolDescriptor, RequestableChannelClass, props};
pub use error::{ManifestError, ManifestResult};
pub use manifest::{Manifest, find, find_in, manifest_path, search_dirs};
pub use param::{ParamFlags, Parameter, validate_parameters};
