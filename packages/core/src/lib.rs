pub mod cache;
pub mod checksum;
pub mod definitions;
pub mod log;
pub mod parse;
pub mod prelude;
pub mod security;
pub mod serialize;
pub mod state_machine;
pub mod util;
pub mod value_id;
pub mod wrapping_counter;
