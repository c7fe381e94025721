pub mod crypto;

mod ctr_drbg;
pub use ctr_drbg::*;

mod s0;
pub use s0::*;

mod s2;
pub use s2::*;
