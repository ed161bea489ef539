//! Generated `tonic`/`prost` bindings for the dispatch façade's gRPC surface
//! (SPEC_FULL.md §6). Kept in its own crate so `jobqueue-core` never takes a
//! transport dependency.

pub mod v1 {
    tonic::include_proto!("jobqueue.v1");
}
