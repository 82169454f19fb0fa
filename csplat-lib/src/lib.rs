pub mod codec;
pub mod common;
pub mod error;
pub mod geom;
pub mod ingest;
pub mod octree;
pub mod sort;
pub mod store;
pub mod worker;

pub use codec::{decode, encode, CompressionLevel, EncodeConfig};
pub use error::SplatError;
pub use geom::{Aabb, CameraPose, Containment, Frustum};
pub use octree::Octree;
pub use sort::{
    CameraDepth, DepthMode, DepthSource, PrecomputedDepth, SortConfig, SortDirection, SplatSorter,
};
pub use store::{SectionData, SectionId, SplatStore};
pub use worker::{Candidates, ChannelMode, ResultGate, SortRequest, SortResult, SortWorker};
