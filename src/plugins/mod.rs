use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Typed service registry shared with every request.
///
/// One instance per value type, registered before the server starts and
/// resolved by type — a compile-time-checked replacement for a reflection
/// container. Repeated lookups of the same type return the same instance.
#[derive(Default, Debug, Clone)]
pub struct Plugins {
    data: Arc<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl Plugins {
    pub fn new() -> Self {
        Self {
            data: Arc::new(HashMap::new()),
        }
    }

    pub(crate) fn insert<T: 'static + Send + Sync>(&mut self, value: T) {
        Arc::get_mut(&mut self.data)
            .expect("Cannot modify the registry after application start")
            .insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.data
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.data.contains_key(&TypeId::of::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct AppName(&'static str);

    #[test]
    fn resolves_by_type() {
        let mut plugins = Plugins::new();
        plugins.insert(AppName("arbor"));
        assert_eq!(plugins.get::<AppName>(), Some(&AppName("arbor")));
        assert!(plugins.get::<String>().is_none());
        assert!(plugins.contains::<AppName>());
    }

    #[test]
    fn clones_share_the_registry() {
        let mut plugins = Plugins::new();
        plugins.insert(AppName("arbor"));
        let view = plugins.clone();
        assert_eq!(view.get::<AppName>(), Some(&AppName("arbor")));
    }
}
