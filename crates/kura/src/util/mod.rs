pub mod http;
pub mod range;
pub mod transport;
pub(crate) mod urls;
