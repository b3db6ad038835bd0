use std::{collections::HashMap, sync::Arc};

use super::{
    fake::Fake, ghz::Ghz, jmeter::JMeter, k6::K6, locust::Locust, Backend, BackendContext, Error,
};
use crate::loadtest::LoadTestType;

/// Table of backends by load test type.
#[derive(Default, Clone)]
pub struct Registry {
    backends: HashMap<LoadTestType, Arc<dyn Backend>>,
}

impl Registry {
    /// Registry holding every built in backend.
    pub fn with_defaults(cx: BackendContext) -> Result<Self, Error> {
        let mut registry = Self::default();
        registry.register(Fake::new(cx.clone()))?;
        registry.register(Ghz::new(cx.clone()))?;
        registry.register(JMeter::new(cx.clone()))?;
        registry.register(K6::new(cx.clone()))?;
        registry.register(Locust::new(cx))?;
        Ok(registry)
    }

    /// Register a backend, a type can only be registered once.
    pub fn register(&mut self, backend: impl Backend + 'static) -> Result<(), Error> {
        let load_test_type = backend.load_test_type();
        if self.backends.contains_key(&load_test_type) {
            return Err(Error::AlreadyRegistered(load_test_type));
        }
        self.backends.insert(load_test_type, Arc::new(backend));
        Ok(())
    }

    /// Backend handling the type.
    pub fn get(&self, load_test_type: LoadTestType) -> Result<Arc<dyn Backend>, Error> {
        self.backends
            .get(&load_test_type)
            .cloned()
            .ok_or(Error::NotRegistered(load_test_type))
    }

    /// Registered types.
    pub fn types(&self) -> impl Iterator<Item = LoadTestType> + '_ {
        self.backends.keys().copied()
    }
}
