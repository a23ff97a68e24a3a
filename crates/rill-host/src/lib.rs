//! The Rill request host.
//!
//! Routes uniform-resource requests through pipelined stages to hosted
//! services: a feature directory resolves `(verb, path)` to exactly one
//! feature, the pipeline drives prologues, the main stage and epilogues, and
//! plugs let services invoke one another without crossing the network.

pub mod context;
pub mod directory;
pub mod error;
pub mod feature;
pub mod host;
pub mod host_features;
pub mod pipeline;
pub mod plug;
pub mod script;
pub mod service;
pub mod stages;

pub use context::{Access, Context, HandlerFn, handler};
pub use directory::{FeatureDirectory, Resolution};
pub use error::{HostError, HostResult};
pub use feature::{Blueprint, Feature, FeatureDescriptor, Signature, verb};
pub use host::{Host, ServiceEntry};
pub use plug::{CallbackEndpoint, Endpoint, EndpointRouter, HttpEndpoint, Plug};
pub use service::{AccessKeys, Service, ServiceContext, ServiceRegistry, ServiceSetup};
pub use stages::{CodecRegistry, DocumentCodec};
