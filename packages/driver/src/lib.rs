pub mod driver;
pub mod error;
pub mod options;

pub use driver::*;
pub use error::{Error, Result};
pub use options::*;

use zwh_logging::{LogInfo, Loglevel};

pub type LogSender = futures::channel::mpsc::Sender<(LogInfo, Loglevel)>;
pub type LogReceiver = futures::channel::mpsc::Receiver<(LogInfo, Loglevel)>;
