/// Where a message originates from. Determines the expected message types
/// when parsing ambiguous function types: an inbound SendData request is the
/// transmission callback, an outbound one is the host's request.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    Host,
    #[default]
    Controller,
}
