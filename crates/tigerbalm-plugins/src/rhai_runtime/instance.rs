//! Interpreter instances and the factory that builds them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rhai::{AST, CallFnOptions, Dynamic, Engine, FnPtr, Map, Scope};
use tigerbalm_kernel::config::SandboxConfig;
use tigerbalm_kernel::{ConsumerGroupMessage, Request, Response};

use super::types::{Handlers, REGISTER_FN, Registration, extract};
use crate::capability::CapabilityTable;
use crate::error::{PluginError, PluginResult};
use crate::marshal::{dynamic_to_response, message_to_dynamic, request_to_dynamic};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Script-visible name of the plugin identity map.
const CONTEXT_VAR: &str = "context";

/// One non-reentrant execution context: its own engine, compiled script and
/// the handler pointers its `register()` call returned.
///
/// An instance is owned by exactly one caller at a time; the pool hands it
/// out by value.
pub struct Interpreter {
    id: u64,
    plugin: String,
    engine: Engine,
    ast: AST,
    handlers: Handlers,
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("id", &self.id)
            .field("plugin", &self.plugin)
            .finish()
    }
}

impl Interpreter {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run the route handler on `req`.
    pub fn call_route(&mut self, req: &Request) -> PluginResult<Response> {
        let handler = self.handlers.route.clone().ok_or_else(|| PluginError::NotHandled {
            plugin: self.plugin.clone(),
            kind: "http",
        })?;
        let result = self.invoke(&handler, request_to_dynamic(req))?;
        dynamic_to_response(result)
    }

    /// Run the consume handler on `msg`. The handler's return value is
    /// ignored.
    pub fn call_consume(&mut self, msg: &ConsumerGroupMessage) -> PluginResult<()> {
        let handler = self.handlers.consume.clone().ok_or_else(|| PluginError::NotHandled {
            plugin: self.plugin.clone(),
            kind: "kafka",
        })?;
        self.invoke(&handler, message_to_dynamic(msg)).map(|_| ())
    }

    fn invoke(&mut self, handler: &FnPtr, arg: Dynamic) -> PluginResult<Dynamic> {
        handler
            .call::<Dynamic>(&self.engine, &self.ast, (arg,))
            .map_err(|e| PluginError::Execution(e.to_string()))
    }
}

/// Builds fresh interpreters for one version of a plugin's script.
///
/// Every build repeats the whole load: new engine, capability table
/// installed, script compiled, top-level body run in a new scope, and
/// `register()` called.
#[derive(Clone)]
pub struct HandlerFactory {
    name: String,
    source: Arc<str>,
    table: CapabilityTable,
    sandbox: SandboxConfig,
}

impl HandlerFactory {
    pub fn new(
        name: impl Into<String>,
        source: Arc<str>,
        table: CapabilityTable,
        sandbox: SandboxConfig,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            table,
            sandbox,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn build(&self) -> PluginResult<(Interpreter, Registration)> {
        let mut engine = Engine::new();
        apply_sandbox(&mut engine, &self.sandbox);
        self.table.install(&mut engine);
        install_context(&mut engine, &self.table.context().name);

        let mut ast = engine
            .compile(&*self.source)
            .map_err(|e| PluginError::Compile(e.to_string()))?;
        ast.set_source(self.name.as_str());

        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| PluginError::Execution(e.to_string()))?;

        if !ast.iter_functions().any(|f| f.name == REGISTER_FN) {
            return Err(PluginError::Registration(format!(
                "script does not define {REGISTER_FN}()"
            )));
        }
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let value = engine
            .call_fn_with_options::<Dynamic>(options, &mut scope, &ast, REGISTER_FN, ())
            .map_err(|e| PluginError::Execution(e.to_string()))?;
        let (registration, handlers) = extract(value, &ast)?;

        let interpreter = Interpreter {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            plugin: self.name.clone(),
            engine,
            ast,
            handlers,
        };
        Ok((interpreter, registration))
    }
}

/// Expose `context` (`#{ Name }`) to the top level and to every function.
fn install_context(engine: &mut Engine, name: &str) {
    let mut context = Map::new();
    context.insert("Name".into(), Dynamic::from(name.to_string()));
    let context = Dynamic::from_map(context).into_read_only();
    engine.on_var(move |var, _, _| {
        if var == CONTEXT_VAR {
            Ok(Some(context.clone()))
        } else {
            Ok(None)
        }
    });
}

fn apply_sandbox(engine: &mut Engine, sandbox: &SandboxConfig) {
    engine.set_max_call_levels(sandbox.max_call_levels);
    engine.set_max_operations(sandbox.max_operations);
    engine.set_max_string_size(sandbox.max_string_size);
    engine.set_max_array_size(sandbox.max_array_size);
    engine.set_max_map_size(sandbox.max_map_size);
    engine.set_strict_variables(false);
    engine.disable_symbol("eval");
}
