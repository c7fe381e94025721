use crate::submodule;

submodule!(command_classes);
submodule!(duration);
submodule!(endpoint_index);
submodule!(frame_addressing);
submodule!(function_type);
submodule!(home_id);
submodule!(message_origin);
submodule!(message_type);
submodule!(node_id);
submodule!(node_id_type);
submodule!(security_class);
submodule!(transmit_options);
submodule!(transmit_status);
