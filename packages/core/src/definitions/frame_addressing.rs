/// How a received frame was addressed to us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAddressing {
    Singlecast,
    Multicast,
    Broadcast,
}
