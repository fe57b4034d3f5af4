//! Module names known at compile time.

use crate::error::ConfigError;
use crate::module::Module;
use crate::module::access::AccessModule;
use crate::module::authentication::AuthenticationModule;
use crate::module::deflate::DeflateModule;
use crate::module::directory::DirectoryModule;
use crate::module::environment_variable::EnvironmentVariableModule;
use crate::module::header::HeaderModule;
use crate::module::location::LocationModule;
use crate::module::proxy::ProxyModule;
use crate::module::rewrite::RewriteModule;
use crate::module::static_file::CoreModule;
use crate::module::virtual_host::VirtualHostModule;

pub const MODULE_NAMES: &[&str] = &[
    VirtualHostModule::NAME,
    AuthenticationModule::NAME,
    EnvironmentVariableModule::NAME,
    RewriteModule::NAME,
    AccessModule::NAME,
    LocationModule::NAME,
    DirectoryModule::NAME,
    CoreModule::NAME,
    ProxyModule::NAME,
    HeaderModule::NAME,
    DeflateModule::NAME,
];

/// Creates an uninitialized module by its configured name.
pub fn create(name: &str) -> Result<Box<dyn Module>, ConfigError> {
    let module: Box<dyn Module> = match name {
        VirtualHostModule::NAME => Box::new(VirtualHostModule::default()),
        AuthenticationModule::NAME => Box::new(AuthenticationModule::default()),
        EnvironmentVariableModule::NAME => Box::new(EnvironmentVariableModule::default()),
        RewriteModule::NAME => Box::new(RewriteModule::default()),
        AccessModule::NAME => Box::new(AccessModule::default()),
        LocationModule::NAME => Box::new(LocationModule::default()),
        DirectoryModule::NAME => Box::new(DirectoryModule::default()),
        CoreModule::NAME => Box::new(CoreModule::default()),
        ProxyModule::NAME => Box::new(ProxyModule::default()),
        HeaderModule::NAME => Box::new(HeaderModule::default()),
        DeflateModule::NAME => Box::new(DeflateModule::default()),
        _ => return Err(ConfigError::UnknownModule(name.to_string())),
    };
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_name_resolves() {
        for name in MODULE_NAMES {
            let module = create(name).unwrap();
            assert_eq!(module.name(), *name);
        }
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(matches!(create("php"), Err(ConfigError::UnknownModule(_))));
    }

    #[test]
    fn default_configuration_lists_only_known_modules() {
        for name in crate::config::DEFAULT_MODULES {
            assert!(MODULE_NAMES.contains(name));
        }
    }
}
