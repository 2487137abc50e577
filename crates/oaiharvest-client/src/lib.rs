pub mod endpoint;
pub mod registry;

pub use endpoint::ReqwestEndpoint;
pub use registry::RegistryReader;
