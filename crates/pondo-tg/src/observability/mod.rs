pub(crate) mod logging;

pub use logging::init_logging;
pub use logging::tracing_err;
