use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use micro_httpd::log::{self, LogConfig};
use micro_httpd::server::{MAX_FD, WebServer};

/// Static file server on an epoll reactor
#[derive(Debug, Parser)]
#[command(name = "micro-httpd", version, about)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 1316)]
    port: u16,

    /// Trigger mode: 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET (listener + connections)
    #[arg(long = "trig", default_value_t = 3)]
    trigger_mode: u8,

    /// Idle timeout in milliseconds, 0 disables it
    #[arg(short = 'm', long, default_value_t = 60_000)]
    timeout: u64,

    /// Close sockets with a one second SO_LINGER
    #[arg(long)]
    linger: bool,

    /// Directory the files are served from, defaults to ./resources
    #[arg(short, long)]
    source_dir: Option<PathBuf>,

    /// Handles in the user database pool
    #[arg(long, default_value_t = 12)]
    sql_pool: usize,

    /// Worker threads
    #[arg(short = 't', long, default_value_t = 6)]
    threads: usize,

    /// Most connections served at once
    #[arg(long, default_value_t = MAX_FD)]
    max_connections: usize,

    /// Turn logging off
    #[arg(long)]
    no_log: bool,

    /// Log level: 0 debug, 1 info, 2 warn, 3 error
    #[arg(short, long, default_value_t = 1)]
    log_level: u8,

    /// Directory for the log files
    #[arg(long, default_value = "./log")]
    log_dir: PathBuf,

    /// Log queue capacity, 0 writes synchronously
    #[arg(long, default_value_t = 1024)]
    log_queue: usize,
}

impl Args {
    fn log_config(&self) -> LogConfig {
        LogConfig {
            enabled: !self.no_log,
            level: self.log_level,
            dir: self.log_dir.clone(),
            queue_size: self.log_queue,
            ..LogConfig::default()
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let log_config = args.log_config();

    let _guard = match log::init(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to init log: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut builder = WebServer::builder()
        .port(args.port)
        .trigger_mode(args.trigger_mode)
        .timeout(Duration::from_millis(args.timeout))
        .linger(args.linger)
        .sql_pool_size(args.sql_pool)
        .thread_num(args.threads)
        .max_connections(args.max_connections)
        .log(log_config);
    if let Some(source_dir) = args.source_dir {
        builder = builder.source_dir(source_dir);
    }

    let mut server = match builder.build() {
        Ok(server) => server,
        Err(e) => {
            error!(cause = %e, "server init error");
            eprintln!("server init error: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(addr = %server.local_addr(), "start listening");
    match server.start() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(cause = %e, "server stopped with error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let args = Args::parse_from(["micro-httpd"]);
        assert_eq!(args.port, 1316);
        assert_eq!(args.trigger_mode, 3);
        assert_eq!(args.timeout, 60_000);
        assert!(!args.linger);
        assert_eq!(args.sql_pool, 12);
        assert_eq!(args.threads, 6);

        let log = args.log_config();
        assert!(log.enabled);
        assert_eq!(log.level, 1);
        assert_eq!(log.queue_size, 1024);
    }

    #[test]
    fn overrides() {
        let args = Args::parse_from(["micro-httpd", "-p", "8080", "--trig", "1", "--no-log", "-l", "0"]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.trigger_mode, 1);
        assert!(!args.log_config().enabled);
        assert_eq!(args.log_config().level, 0);
    }
}
