//! Registration metadata extracted from a script's `register()` result.

use rhai::{AST, Dynamic, FnPtr, Map};
use tigerbalm_kernel::{ConsumeKey, RouteKey};

use crate::error::{PluginError, PluginResult};
use crate::marshal::{as_string, field};

/// Name of the script function that returns the registration map.
pub const REGISTER_FN: &str = "register";

// ============================================================================
// Registration
// ============================================================================

/// Bindings a plugin asks for. Either part may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    pub route: Option<RouteKey>,
    pub consume: Option<ConsumeKey>,
}

impl Registration {
    pub fn is_empty(&self) -> bool {
        self.route.is_none() && self.consume.is_none()
    }
}

/// Handler function pointers, valid only for the interpreter that produced
/// them.
#[derive(Debug, Clone, Default)]
pub(crate) struct Handlers {
    pub route: Option<FnPtr>,
    pub consume: Option<FnPtr>,
}

/// Read the `register()` result.
///
/// Expected shape:
///
/// ```text
/// #{
///     route:   #{ "match": #{ path, method },  handler },
///     consume: #{ "match": #{ topic, group },  handler },
/// }
/// ```
pub(crate) fn extract(value: Dynamic, ast: &AST) -> PluginResult<(Registration, Handlers)> {
    let type_name = value.type_name();
    let Some(map) = value.try_cast::<Map>() else {
        return Err(PluginError::Registration(format!(
            "{REGISTER_FN}() must return a map, got {type_name}"
        )));
    };

    let mut registration = Registration::default();
    let mut handlers = Handlers::default();

    if let Some(route) = field(&map, "route", "Route") {
        let route = section(route, "route")?;
        let matches = match_section(&route, "route")?;
        let path = required_str(&matches, "path", "Path", "route")?;
        let method = required_str(&matches, "method", "Method", "route")?;
        handlers.route = Some(handler(&route, ast, "route")?);
        registration.route = Some(RouteKey::new(method, path));
    }

    if let Some(consume) = field(&map, "consume", "Consume") {
        let consume = section(consume, "consume")?;
        let matches = match_section(&consume, "consume")?;
        let topic = required_str(&matches, "topic", "Topic", "consume")?;
        let group = required_str(&matches, "group", "Group", "consume")?;
        handlers.consume = Some(handler(&consume, ast, "consume")?);
        registration.consume = Some(ConsumeKey::new(topic, group));
    }

    Ok((registration, handlers))
}

fn section(value: &Dynamic, name: &str) -> PluginResult<Map> {
    value
        .clone()
        .try_cast::<Map>()
        .ok_or_else(|| PluginError::Registration(format!("{name} must be a map")))
}

fn match_section(section: &Map, name: &str) -> PluginResult<Map> {
    let matches = field(section, "match", "Match")
        .ok_or_else(|| PluginError::Registration(format!("{name} has no match")))?;
    matches
        .clone()
        .try_cast::<Map>()
        .ok_or_else(|| PluginError::Registration(format!("{name}.match must be a map")))
}

fn required_str(map: &Map, lower: &str, upper: &str, section: &str) -> PluginResult<String> {
    field(map, lower, upper)
        .and_then(as_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            PluginError::Registration(format!("{section}.match.{lower} must be a non-empty string"))
        })
}

fn handler(section: &Map, ast: &AST, name: &str) -> PluginResult<FnPtr> {
    let value = field(section, "handler", "Handler")
        .ok_or_else(|| PluginError::MissingHandler(name.to_string()))?;

    let fn_ptr = if value.is::<FnPtr>() {
        value.clone().cast::<FnPtr>()
    } else if let Some(fn_name) = as_string(value) {
        FnPtr::new(fn_name).map_err(|_| PluginError::MissingHandler(name.to_string()))?
    } else {
        return Err(PluginError::MissingHandler(name.to_string()));
    };

    if !fn_ptr.is_anonymous() && !ast.iter_functions().any(|f| f.name == fn_ptr.fn_name()) {
        return Err(PluginError::MissingHandler(format!(
            "{name} ({} is not defined)",
            fn_ptr.fn_name()
        )));
    }
    Ok(fn_ptr)
}
