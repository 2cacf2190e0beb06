pub mod detect;
pub mod manifests;
