mod request_node_info;

pub use request_node_info::*;
