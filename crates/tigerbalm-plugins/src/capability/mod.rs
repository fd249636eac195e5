//! Capability broker.
//!
//! A script reaches the host only through `require(name)`. The broker builds
//! one [`CapabilityTable`] per interpreter, bound to the owning plugin's
//! [`PluginContext`], and installs `require` into that interpreter's engine.
//! Resolution is a table lookup: unknown names and bad calls return `()` and
//! are logged, never raised into the script.
//!
//! | Module    | Object      | Methods                                               |
//! |-----------|-------------|-------------------------------------------------------|
//! | `"http"`  | `Http`      | `do_request(#{Method, Host, Path, Query, Header, Body})` |
//! | `"log"`   | `Log`       | `trace`, `debug`, `info`, `warn`, `error`, `fatal`, `log(level, msg)` |
//! | `"kafka"` | `Producer`  | `produce(#{Topic, Payload, Key, Header})`              |
//! | `"env"`   | `Env`       | `get(name)`                                           |

use std::sync::Arc;

use rhai::{Dynamic, Engine, Map, NativeCallContext, Position};
use tigerbalm_kernel::config::{EnvVar, TigerbalmConfig};
use tigerbalm_kernel::{LogLevel, MessageSink, PluginContext};
use tracing::error;

pub mod env;
pub mod http;
pub mod kafka;
pub mod log;

pub use env::EnvCapability;
pub use http::HttpCapability;
pub use kafka::ProduceCapability;
pub use log::LogCapability;

use crate::error::PluginResult;
use crate::logger::{LoggerFactory, PluginLogger};

/// Module names `require` understands.
pub const MODULES: &[&str] = &["http", "log", "kafka", "env"];

const LEVEL_METHODS: &[(&str, LogLevel)] = &[
    ("trace", LogLevel::Trace),
    ("debug", LogLevel::Debug),
    ("info", LogLevel::Info),
    ("warn", LogLevel::Warn),
    ("error", LogLevel::Error),
    ("fatal", LogLevel::Fatal),
];

/// Host-side source of capability objects.
pub struct CapabilityBroker {
    http: HttpCapability,
    loggers: Arc<LoggerFactory>,
    producer: Option<Arc<dyn MessageSink>>,
    env: EnvCapability,
}

impl CapabilityBroker {
    pub fn new(http: HttpCapability, loggers: Arc<LoggerFactory>) -> Self {
        Self {
            http,
            loggers,
            producer: None,
            env: EnvCapability::default(),
        }
    }

    /// Broker wired from the host configuration, without a producer.
    pub fn from_config(config: &TigerbalmConfig) -> PluginResult<Self> {
        let http = HttpCapability::new(&config.http_client)?;
        let loggers = Arc::new(LoggerFactory::new(config.plugin.log.clone()));
        Ok(Self::new(http, loggers).with_env(&config.env))
    }

    /// Expose `require("kafka")` backed by `sink`.
    pub fn with_producer(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.producer = Some(sink);
        self
    }

    pub fn with_env(mut self, vars: &[EnvVar]) -> Self {
        self.env = EnvCapability::new(vars);
        self
    }

    pub fn loggers(&self) -> &Arc<LoggerFactory> {
        &self.loggers
    }

    /// Resolve every capability for the plugin named in `context`.
    pub fn table(&self, context: &PluginContext) -> PluginResult<CapabilityTable> {
        let logger = self.loggers.get(&context.name)?;
        Ok(CapabilityTable {
            context: context.clone(),
            http: self.http.clone(),
            log: LogCapability::new(logger),
            kafka: self.producer.clone().map(ProduceCapability::new),
            env: self.env.clone(),
        })
    }
}

/// Capabilities bound to one plugin identity.
#[derive(Clone)]
pub struct CapabilityTable {
    context: PluginContext,
    http: HttpCapability,
    log: LogCapability,
    kafka: Option<ProduceCapability>,
    env: EnvCapability,
}

impl CapabilityTable {
    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    pub fn logger(&self) -> &PluginLogger {
        self.log.logger()
    }

    /// The object behind `module`, if the host provides it.
    pub fn resolve(&self, module: &str) -> Option<Dynamic> {
        match module {
            "http" => Some(Dynamic::from(self.http.clone())),
            "log" => Some(Dynamic::from(self.log.clone())),
            "kafka" => self.kafka.clone().map(Dynamic::from),
            "env" => Some(Dynamic::from(self.env.clone())),
            _ => None,
        }
    }

    /// Register the capability types, `require` and the print/debug hooks
    /// on `engine`.
    pub fn install(&self, engine: &mut Engine) {
        register_types(engine);

        let table = self.clone();
        engine.register_fn("require", move |ctx: NativeCallContext, module: Dynamic| {
            table.require(ctx.position(), &module)
        });

        let table = self.clone();
        engine.register_fn("require", move |ctx: NativeCallContext| {
            table.bad_arity(ctx.position(), 0)
        });
        let table = self.clone();
        engine.register_fn(
            "require",
            move |ctx: NativeCallContext, _a: Dynamic, _b: Dynamic| table.bad_arity(ctx.position(), 2),
        );
        let table = self.clone();
        engine.register_fn(
            "require",
            move |ctx: NativeCallContext, _a: Dynamic, _b: Dynamic, _c: Dynamic| {
                table.bad_arity(ctx.position(), 3)
            },
        );

        let logger = self.logger().clone();
        engine.on_print(move |text| logger.log(LogLevel::Info, text));
        let logger = self.logger().clone();
        engine.on_debug(move |text, _source, pos| {
            logger.log(LogLevel::Debug, &format!("{text} ({})", describe(pos)))
        });
    }

    fn require(&self, pos: Position, module: &Dynamic) -> Dynamic {
        let Some(name) = crate::marshal::as_string(module) else {
            self.report(pos, &format!("require expects a string, got {}", module.type_name()));
            return Dynamic::UNIT;
        };
        match self.resolve(&name) {
            Some(capability) => capability,
            None => {
                self.report(pos, &format!("require: no such module {name:?}"));
                Dynamic::UNIT
            }
        }
    }

    fn bad_arity(&self, pos: Position, argc: usize) -> Dynamic {
        self.report(pos, &format!("require takes exactly one argument, got {argc}"));
        Dynamic::UNIT
    }

    fn report(&self, pos: Position, message: &str) {
        let location = describe(pos);
        error!(plugin = %self.context.name, %location, "{message}");
        self.logger()
            .log(LogLevel::Error, &format!("{message} at {location}"));
    }
}

fn describe(pos: Position) -> String {
    if pos.is_none() {
        "unknown location".to_string()
    } else {
        pos.to_string()
    }
}

fn register_types(engine: &mut Engine) {
    engine
        .register_type_with_name::<HttpCapability>("Http")
        .register_fn("do_request", |http: &mut HttpCapability, fields: Dynamic| {
            match fields.try_cast::<Map>() {
                Some(fields) => http.call(&fields),
                None => Dynamic::UNIT,
            }
        });

    engine.register_type_with_name::<LogCapability>("Log");
    for &(name, level) in LEVEL_METHODS {
        engine.register_fn(name, move |log: &mut LogCapability, msg: Dynamic| {
            log.write(level, &msg)
        });
    }
    engine.register_fn("log", |log: &mut LogCapability, level: &str, msg: Dynamic| {
        log.write_named(level, &msg)
    });

    engine
        .register_type_with_name::<ProduceCapability>("Producer")
        .register_fn("produce", |producer: &mut ProduceCapability, fields: Dynamic| {
            match fields.try_cast::<Map>() {
                Some(fields) => producer.produce(&fields),
                None => false,
            }
        });

    engine
        .register_type_with_name::<EnvCapability>("Env")
        .register_fn("get", |env: &mut EnvCapability, name: &str| env.get(name));
}
