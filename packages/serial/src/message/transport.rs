mod application_command;
mod bridge_application_command;
mod send_data;
mod send_data_abort;

pub use application_command::*;
pub use bridge_application_command::*;
pub use send_data::*;
pub use send_data_abort::*;
