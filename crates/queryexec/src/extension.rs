use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use exprproto::ExtensionNames;
use typereg::Value;

use crate::errors::Result;

/// Evaluates extension nodes with a given name.
///
/// Arguments are evaluated eagerly and passed in order.
pub trait ScalarExtension: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn invoke(&self, args: &[Value]) -> Result<Value>;
}

/// Extensions known to an evaluator.
#[derive(Debug, Clone, Default)]
pub struct ExtensionRegistry {
    extensions: HashMap<String, Arc<dyn ScalarExtension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension(mut self, ext: Arc<dyn ScalarExtension>) -> Self {
        self.register(ext);
        self
    }

    pub fn register(&mut self, ext: Arc<dyn ScalarExtension>) {
        self.extensions.insert(ext.name().to_string(), ext);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ScalarExtension>> {
        self.extensions.get(name)
    }

    /// Names to configure a tree codec with.
    pub fn names(&self) -> ExtensionNames {
        self.extensions.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Echo;

    impl ScalarExtension for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn invoke(&self, args: &[Value]) -> Result<Value> {
            Ok(args.first().cloned().unwrap_or(Value::Null))
        }
    }

    #[test]
    fn lookup_and_names() {
        let registry = ExtensionRegistry::new().with_extension(Arc::new(Echo));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("other").is_none());

        let names = registry.names();
        assert!(names.contains("echo"));
        assert!(!names.contains("other"));
    }
}
