pub use shellhub_log::{LoggerGuard, StaticLogConfig, init};

pub struct GatewayLog;

impl StaticLogConfig for GatewayLog {
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "gateway";
}

pub type LogDeleterTask = shellhub_log::LogDeleterTask<GatewayLog>;
