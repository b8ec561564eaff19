pub mod frames;
pub mod k8s;
