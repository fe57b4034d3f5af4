use std::sync::Arc;

use crate::context::{RequestContext, ServerContext};
use crate::error::{ConfigError, RequestError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::module::{Hook, Module, registry};

/// Ordered list of modules, fired hook by hook.
///
/// The configured order is the execution order. Declared dependencies are
/// checked when the pipeline is built but never used to reorder it.
pub struct ModulePipeline {
    modules: Vec<Box<dyn Module>>,
}

impl ModulePipeline {
    /// Instantiates the configured module list through the registry.
    pub fn from_config(server: &Arc<ServerContext>) -> Result<Self, ConfigError> {
        let modules = server
            .config
            .modules
            .iter()
            .map(|name| registry::create(name))
            .collect::<Result<Vec<_>, _>>()?;
        Self::build(server, modules)
    }

    /// Initializes and prepares `modules`, then checks their dependencies.
    pub fn build(
        server: &Arc<ServerContext>,
        mut modules: Vec<Box<dyn Module>>,
    ) -> Result<Self, ConfigError> {
        for module in &mut modules {
            module.init(Arc::clone(server))?;
            module.prepare()?;
        }

        for (position, module) in modules.iter().enumerate() {
            for dependency in module.dependencies() {
                match modules.iter().position(|m| m.name() == *dependency) {
                    None => {
                        return Err(ConfigError::MissingDependency {
                            module: module.name(),
                            dependency,
                        });
                    }
                    Some(found) if found > position => {
                        tracing::warn!(
                            module = module.name(),
                            dependency = *dependency,
                            "Module is configured before its dependency"
                        );
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(Self { modules })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Runs `hook` on every module in order.
    ///
    /// During `REQUEST_POST` the loop stops as soon as the response is
    /// dispatched. The other hooks always reach every module.
    pub async fn fire(
        &mut self,
        hook: Hook,
        request: &mut Request,
        response: &mut Response,
        ctx: &mut RequestContext,
    ) -> Result<(), RequestError> {
        for module in &mut self.modules {
            if hook == Hook::RequestPost && response.is_dispatched() {
                break;
            }
            tracing::trace!(module = module.name(), %hook, "Processing module");
            module.process(request, response, ctx, hook).await?;
        }
        Ok(())
    }
}
