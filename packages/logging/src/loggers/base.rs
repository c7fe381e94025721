use crate::{LogFormatter, LogInfo, Logger, Loglevel};
use termcolor::WriteColor;

/// Writes formatted log output to a colored writer. This is the endpoint of
/// the log channel; all other loggers are thin frontends that build LogInfo
/// records.
pub struct BaseLogger {
    pub level: Loglevel,
    pub writer: Box<dyn WriteColor + Send>,
    pub formatter: Box<dyn LogFormatter + Send>,
}

impl Logger for BaseLogger {
    fn log(&mut self, log: LogInfo, level: Loglevel) {
        if level > self.level {
            return;
        }
        let formatted = self.formatter.format_log(&log, level);
        for str in formatted {
            if let Some(color) = str.color {
                let _ = self.writer.set_color(&color);
            }
            let _ = self.writer.write_all(str.string.as_bytes());
        }
        let _ = self.writer.reset();
    }

    fn log_level(&self) -> Loglevel {
        self.level
    }

    fn set_log_level(&mut self, level: Loglevel) {
        self.level = level;
    }
}
