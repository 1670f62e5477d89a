//! Built-in node types for the trusted execution path.

mod noop;
mod set;
mod wait;

use flowcell_core::handler::registry::{HandlerRegistry, RegistryError};

pub use noop::NoopHandler;
pub use set::SetHandler;
pub use wait::WaitHandler;

/// Register every built-in handler.
///
/// Fails on the first duplicate node type; startup should abort.
pub fn register_builtins(registry: &mut HandlerRegistry) -> Result<(), RegistryError> {
    registry.register("set", SetHandler)?;
    registry.register("noop", NoopHandler)?;
    registry.register("wait", WaitHandler)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_builtins() {
        let mut registry = HandlerRegistry::new();
        register_builtins(&mut registry).unwrap();
        assert_eq!(registry.node_types(), vec!["noop", "set", "wait"]);
    }

    #[test]
    fn second_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        register_builtins(&mut registry).unwrap();
        let err = register_builtins(&mut registry).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(ref name) if name == "set"));
    }
}
