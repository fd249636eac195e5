//! Configured environment values (`require("env")`).

use std::collections::BTreeMap;
use std::sync::Arc;

use rhai::Dynamic;
use tigerbalm_kernel::config::EnvVar;

#[derive(Clone, Debug, Default)]
pub struct EnvCapability {
    vars: Arc<BTreeMap<String, String>>,
}

impl EnvCapability {
    /// First definition of a name wins.
    pub fn new(vars: &[EnvVar]) -> Self {
        let mut map = BTreeMap::new();
        for var in vars {
            map.entry(var.name.clone()).or_insert_with(|| var.value.clone());
        }
        Self { vars: Arc::new(map) }
    }

    pub fn get(&self, name: &str) -> Dynamic {
        self.vars
            .get(name)
            .map(|v| Dynamic::from(v.clone()))
            .unwrap_or(Dynamic::UNIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let env = EnvCapability::new(&[EnvVar::new("A", "1"), EnvVar::new("A", "2")]);
        assert_eq!(env.get("A").into_string().unwrap(), "1");
        assert!(env.get("B").is_unit());
    }
}
