//! 一个极简的 `log` 后端: 带本地时间戳输出到 stderr.
//! 默认级别取自环境变量 JOURNAL_LOG (off/error/warn/info/debug/trace), 命令行可以覆盖.

use std::env;

use chrono::Local;
use lazy_static::lazy_static;
use log::{LevelFilter, Log, Metadata, Record};

struct Logger;

static LOGGER: Logger = Logger;

lazy_static! {
    static ref ENV_LEVEL: LevelFilter = env::var("JOURNAL_LOG")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(LevelFilter::Info);
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!(
            "[{} {:>5} {}] {}",
            Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// 安装日志后端. 重复调用只会更新级别
pub fn init(level: Option<LevelFilter>) {
    // 已经安装过时 set_logger 会失败, 忽略即可
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level.unwrap_or(*ENV_LEVEL));
}
