//! # Provisioners
//!
//! Typed front-ends that declare nodes in a [`ResourceGraph`](crate::graph::ResourceGraph).
//! Each provisioner borrows the graph mutably and enforces its own invariants
//! at declaration time; cross-resource wiring (key grants, bucket policies,
//! ordering edges) is added to the graph as part of the same call.

pub mod bucket;
pub mod catalog;
pub mod key;
pub mod permissions;
pub mod table;
pub mod trail;
pub mod workgroup;

pub use bucket::{BucketEncryption, BucketHandle, BucketProps, ObjectOwnership};
pub use key::{compute_grants, KeyCapability, KeyGrant, KeyHandle};
pub use permissions::{CatalogRef, Permission};
pub use table::{DatabaseHandle, TableHandle};
pub use trail::{DataEventScope, InsightType, TrailDeclaration, TrailHandle};
pub use workgroup::{WorkGroupHandle, WorkGroupProps};
