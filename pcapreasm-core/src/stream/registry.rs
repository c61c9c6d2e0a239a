use super::{LayerContext, LayerFactory};

/// Registry of available layer factories.
pub struct LayerRegistry {
    factories: Vec<Box<dyn LayerFactory>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Registry with the built-in framers (http, tls, http2, grpc).
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        super::parsers::register_builtin(&mut registry);
        registry
    }

    /// Register a layer factory. Earlier registrations win root detection.
    pub fn register<F: LayerFactory + 'static>(&mut self, factory: F) {
        self.factories.push(Box::new(factory));
    }

    /// Find a factory that claims a new root stream.
    pub fn find_factory(&self, context: &LayerContext) -> Option<&dyn LayerFactory> {
        self.factories
            .iter()
            .find(|f| f.matches(context))
            .map(|f| f.as_ref())
    }

    /// Get a factory by kind.
    pub fn get_factory(&self, kind: &str) -> Option<&dyn LayerFactory> {
        self.factories
            .iter()
            .find(|f| f.kind() == kind)
            .map(|f| f.as_ref())
    }

    /// Get all registered kinds.
    pub fn factory_names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.kind()).collect()
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
