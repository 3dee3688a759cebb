use anyhow::Result;
use lib_common::loggers::{LogOptions, init_tracing};
use tracing_appender::non_blocking::WorkerGuard;

use crate::order_logic::config::ServerConfig;

/// Installs tracing for the order server. The returned guard must outlive
/// the server; dropping it flushes the file writer.
pub fn setup_logging(config: &ServerConfig) -> Result<Option<WorkerGuard>> {
    let options = LogOptions {
        level: Some(config.log_level.clone()),
        json: config.log_json,
        log_dir: Some(config.log_dir.clone()),
        file_prefix: "server_orders".to_string(),
        retain: 7,
    };
    Ok(init_tracing(&options)?)
}
