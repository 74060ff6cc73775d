//! Client context – the collaborators every caller works against.

use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::materializer::DocumentMaterializer;
use crate::orchestrator::{Credentials, Orchestrator};
use crate::platform::{HostEndpoint, ProcessAuthoringService, ProcessEngineProvider, StdFilesystem};
use crate::traits::*;

/// Resolved once at startup. Callers (CLI, tests) swap implementations by
/// constructing the context with different trait objects.
pub struct ClientContext {
    engine: Arc<dyn EngineProvider>,
    fs: Arc<dyn FilesystemOps>,
    authoring: Option<Arc<dyn AuthoringService>>,
    credentials: Option<Credentials>,
    template: Option<String>,
}

impl ClientContext {
    pub fn new(engine: Arc<dyn EngineProvider>, fs: Arc<dyn FilesystemOps>) -> Self {
        Self {
            engine,
            fs,
            authoring: None,
            credentials: None,
            template: None,
        }
    }

    /// Real engine host and filesystem; an authoring host only when given.
    pub fn from_endpoints(engine: HostEndpoint, authoring: Option<(HostEndpoint, bool)>) -> Self {
        let mut ctx = Self::new(
            Arc::new(ProcessEngineProvider::new(engine)),
            Arc::new(StdFilesystem),
        );
        if let Some((endpoint, visible)) = authoring {
            ctx.authoring = Some(Arc::new(ProcessAuthoringService::new(endpoint, visible)));
        }
        ctx
    }

    pub fn with_authoring(mut self, service: Arc<dyn AuthoringService>) -> Self {
        self.authoring = Some(service);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn fs(&self) -> &dyn FilesystemOps {
        self.fs.as_ref()
    }

    /// Build the dispatcher. A foreground owns exactly one, since the busy
    /// flag lives there.
    pub fn dispatcher(&self) -> Dispatcher {
        let mut orchestrator = Orchestrator::new(self.engine.clone());
        if let Some(credentials) = &self.credentials {
            orchestrator = orchestrator.with_credentials(credentials.clone());
        }
        Dispatcher::new(Arc::new(orchestrator))
    }

    pub fn materializer(&self) -> DocumentMaterializer {
        let mut materializer = DocumentMaterializer::new(self.fs.clone());
        if let Some(service) = &self.authoring {
            materializer = materializer.with_authoring(service.clone());
        }
        if let Some(template) = &self.template {
            materializer = materializer.with_template(template.clone());
        }
        materializer
    }
}
