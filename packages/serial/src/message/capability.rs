mod get_controller_id;
mod get_controller_version;

pub use get_controller_id::*;
pub use get_controller_version::*;
