pub mod annotations;
pub mod common;
pub mod divisibility;
pub mod infer;
pub mod ir;
pub mod kernels;
pub mod layout;
pub mod pprint;
pub mod target;
pub mod utils;

// Exported for the `shape!` and `tile!` macros.
pub use smallvec;
