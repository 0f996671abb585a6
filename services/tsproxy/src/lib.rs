pub mod config;
pub mod http;
pub mod proxy;
pub mod source;

pub use config::{Config, LogFormat};
pub use proxy::{
    validate, ApplyError, BackendResolver, FixedHostResolver, ListenerConfig, ListenerKey, Manager,
    ManagerBuilder, ManagerSnapshot, Mapping, OwnerKey, ReconcileOutcome, ServiceDnsResolver,
};
pub use source::{DesiredState, FileSource, ProxySpec, SyncReport};
