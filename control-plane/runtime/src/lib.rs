#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use consul_k8s_controllers as controllers;
pub use consul_k8s_core as core;
pub use consul_k8s_k8s_api as k8s;
pub use consul_k8s_mesh as mesh;

mod admission;
mod args;
mod lease;

pub use self::args::Args;
