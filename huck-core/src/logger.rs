use slog::Drain;
use slog::Logger;

lazy_static! {
    static ref ROOT: Logger = {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, slog::o!())
    };
}

/// The process-wide root logger. Components derive child loggers with their
/// own key/value context from this one.
pub fn get_root_logger() -> &'static Logger {
    &ROOT
}
