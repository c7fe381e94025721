mod application_update;
mod serial_api_started;

pub use application_update::*;
pub use serial_api_started::*;
