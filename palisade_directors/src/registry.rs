//! Director name registry.
//!
//! Directors reference their children by handle, but configuration talks
//! in names. The registry maps names to directors for the life of the
//! configuration, outliving any individual resolution, so a director
//! never needs an owning reference to a sibling.

use crate::director::{Director, Pick};
use crate::error::{DirResult, DirectorError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Name-to-director map for one configuration generation.
#[derive(Default)]
pub struct DirectorRegistry {
    inner: RwLock<HashMap<String, Arc<dyn Director>>>,
}

impl DirectorRegistry {
    /// Empty registry.
    pub fn new() -> DirectorRegistry {
        DirectorRegistry::default()
    }

    /// Register a director under its name. Names are unique.
    pub fn register(&self, dir: Arc<dyn Director>) -> DirResult<()> {
        let mut inner = self.inner.write();
        let name = dir.name().to_string();
        if inner.contains_key(&name) {
            return Err(DirectorError::NameTaken { name });
        }
        inner.insert(name, dir);
        Ok(())
    }

    /// Look up by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Director>> {
        self.inner.read().get(name).cloned()
    }

    /// Drop a name; in-flight holders keep their handles.
    pub fn unregister(&self, name: &str) -> bool {
        self.inner.write().remove(name).is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.inner.read().keys().cloned().collect();
        v.sort();
        v
    }

    /// Resolve the named director one step.
    pub fn resolve(&self, name: &str, ctx: &mut palisade_core::ws::Ctx) -> Option<Pick> {
        self.lookup(name)?.resolve(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::ws::Ctx;

    struct Nothing(String);

    impl Director for Nothing {
        fn name(&self) -> &str {
            &self.0
        }
        fn type_name(&self) -> &'static str {
            "test"
        }
        fn healthy(&self, _: &mut Ctx, _: f64) -> (bool, f64) {
            (false, 0.0)
        }
        fn resolve(&self, _: &mut Ctx) -> Option<Pick> {
            None
        }
        fn list(&self, _: &mut Ctx, _: &mut String, _: bool) {}
    }

    #[test]
    fn test_register_lookup_unregister() {
        let reg = DirectorRegistry::new();
        reg.register(Arc::new(Nothing("d1".into()))).unwrap();
        reg.register(Arc::new(Nothing("d2".into()))).unwrap();

        assert!(reg.lookup("d1").is_some());
        assert_eq!(reg.names(), ["d1", "d2"]);

        let dup = reg.register(Arc::new(Nothing("d1".into())));
        assert!(matches!(dup, Err(DirectorError::NameTaken { .. })));

        // A handle taken before unregister stays valid.
        let held = reg.lookup("d2").unwrap();
        assert!(reg.unregister("d2"));
        assert!(reg.lookup("d2").is_none());
        assert_eq!(held.name(), "d2");
    }
}
