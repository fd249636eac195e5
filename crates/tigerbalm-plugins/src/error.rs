//! Plugin runtime errors.

use tigerbalm_kernel::DispatchError;

/// Errors raised while compiling, registering or running a plugin.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum PluginError {
    /// Script failed to parse.
    #[error("compilation error: {0}")]
    Compile(String),

    /// Top-level script body or `register()` raised an error.
    #[error("execution error: {0}")]
    Execution(String),

    /// `register()` is missing or returned the wrong shape.
    #[error("registration error: {0}")]
    Registration(String),

    /// A registration names a handler that is not a function.
    #[error("handler for {0} is not a function")]
    MissingHandler(String),

    /// The handler factory could not produce an interpreter.
    #[error("interpreter unavailable: {0}")]
    InterpreterUnavailable(String),

    /// The plugin has no route/consume handler for this kind of event.
    #[error("plugin {plugin} does not handle {kind}")]
    NotHandled { plugin: String, kind: &'static str },

    /// The handler returned a value that cannot be turned into a response.
    #[error("invalid handler result: {0}")]
    InvalidResult(String),

    /// Log sink could not be opened.
    #[error("log sink error: {0}")]
    LogSink(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Plugin result type
pub type PluginResult<T = ()> = Result<T, PluginError>;

impl From<PluginError> for DispatchError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::InterpreterUnavailable(reason) => DispatchError::InterpreterUnavailable(reason),
            PluginError::NotHandled { plugin, kind } => {
                DispatchError::NotFound(format!("{kind} handler of plugin {plugin}"))
            }
            other => DispatchError::Handler(other.to_string()),
        }
    }
}
