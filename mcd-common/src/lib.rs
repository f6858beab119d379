// mcd-common - Shared wire types and protocol definitions for McdConn
//
// This crate defines the frame container, document value objects, error
// classification and both wire codecs (binary protocol and Greenstack).

pub mod descriptor;
pub mod error;
pub mod frame;
pub mod greenstack;
pub mod mcbp;
pub mod sasl;
pub mod types;

// Re-export for convenience
pub use descriptor::*;
pub use error::*;
pub use frame::*;
pub use types::*;
