//! Port definitions (driven/secondary ports).
//!
//! Adapter crates implement these traits; the core only ever talks to the
//! object store through them.

pub mod object_store;

pub use object_store::{
    BlobItem, Capabilities, DirMarkerScheme, GetBlobOutput, GetBlobRequest, HeadBlobOutput,
    ListBlobsOutput, ListBlobsRequest, Metadata, MultipartPart, ObjectBackend, PutBlobOutput,
    PutBlobRequest, StoreError, UploadListing,
};
